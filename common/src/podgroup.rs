use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// A set of pods that must be scheduled together to satisfy a min-member
/// threshold (gang scheduling).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGroup {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodGroupSpec,
    #[serde(default)]
    pub status: PodGroupStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupSpec {
    #[serde(default)]
    pub min_member: u32,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub preemptible: Option<bool>,
    #[serde(default)]
    pub sub_groups: Vec<SubGroupSpec>,
    #[serde(default)]
    pub topology_constraint: Option<TopologyConstraintSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubGroupSpec {
    pub name: String,
    #[serde(default)]
    pub min_member: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConstraintSpec {
    pub topology: String,
    #[serde(default)]
    pub required_level: Option<String>,
    #[serde(default)]
    pub preferred_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupStatus {
    #[serde(default)]
    pub phase: PodGroupPhase,
    /// Most recent transition of the group to fully-allocated.
    #[serde(default)]
    pub last_start_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduling_conditions: Vec<SchedulingCondition>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodGroupPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingCondition {
    pub reason: String,
    pub message: String,
    #[serde(default)]
    pub transition_time: Option<DateTime<Utc>>,
}
