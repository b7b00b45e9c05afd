use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Created by the scheduler for every committed allocation; the binder
/// attests the actual pod-to-node binding asynchronously.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    pub metadata: ObjectMeta,
    pub spec: BindRequestSpec,
    #[serde(default)]
    pub status: BindRequestStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequestSpec {
    pub pod_name: String,
    pub selected_node: String,
    /// GPU groups the pod was assigned to for shared-GPU placements.
    #[serde(default)]
    pub selected_gpu_groups: Vec<String>,
    /// The bind is deferred until the named victims release their
    /// resources (pipelined allocation).
    #[serde(default)]
    pub wait_for_release: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequestStatus {
    #[serde(default)]
    pub phase: BindPhase,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BindPhase {
    #[default]
    Pending,
    Succeeded,
    Failed,
}
