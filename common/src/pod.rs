use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;
use crate::node::Toleration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: Option<String>,
    /// Requests of the main containers, summed, as quantity strings.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Per-init-container requests; the effective request is the
    /// coordinate-wise max of the main sum and each init container.
    #[serde(default)]
    pub init_resources: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub scheduling_gated: bool,
    /// Persistent volume claims referenced by the pod. Claims in
    /// `owned_claims` are deleted with the pod.
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub owned_claims: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub nominated_node_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}
