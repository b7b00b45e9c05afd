use serde::{Deserialize, Serialize};

use common::topology::Topology;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyLevel {
    pub name: String,
    pub node_label: String,
}

/// Ordered levels of one physical hierarchy, root first. Domains are
/// materialized per job by the topology plugin; a domain id at level L is
/// the dot-join of a node's label values from the root through L.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub name: String,
    pub levels: Vec<TopologyLevel>,
}

impl TopologyInfo {
    pub fn from_resource(topology: &Topology) -> Self {
        Self {
            name: topology.metadata.name.clone(),
            levels: topology
                .spec
                .levels
                .iter()
                .map(|level| TopologyLevel {
                    name: level.name.clone(),
                    node_label: level.node_label.clone(),
                })
                .collect(),
        }
    }

    pub fn level_index(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|level| level.name == name)
    }

    /// Domain id of a node at the given level depth, when every level label
    /// up to it is present on the node.
    pub fn domain_id(
        &self,
        labels: &std::collections::BTreeMap<String, String>,
        depth: usize,
    ) -> Option<String> {
        let mut parts = Vec::with_capacity(depth + 1);
        for level in self.levels.iter().take(depth + 1) {
            parts.push(labels.get(&level.node_label)?.as_str());
        }
        Some(parts.join("."))
    }
}
