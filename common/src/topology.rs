use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Describes a physical hierarchy (zone, rack, ...) as an ordered list of
/// levels, each backed by a node label key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub metadata: ObjectMeta,
    pub spec: TopologySpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    /// Root first. A domain id at level L is the dot-join of the node's
    /// label values from the root level through L.
    pub levels: Vec<TopologyLevelSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyLevelSpec {
    pub name: String,
    pub node_label: String,
}
