use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::node::Toleration;
use common::pod::{PodPhase, PodResource};
use common::annotations;

use crate::events::EventReason;
use crate::resources::ResourceRequirements;

/// Name of the implicit sub-group pods without a sub-group label fall into.
pub const DEFAULT_SUB_GROUP: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodStatus {
    Pending,
    Allocated,
    Pipelined,
    Binding,
    Bound,
    Running,
    Releasing,
    Succeeded,
    Failed,
    Unknown,
    Gated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionRecord {
    pub reason: EventReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraClaimRef {
    pub name: String,
    pub device_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTerm {
    pub key: String,
    pub value: String,
}

/// Required (anti-)affinity terms evaluated against the label counts of
/// pods already placed on a node, within a topology label's domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodAffinityTerms {
    pub required: Vec<LabelTerm>,
    pub anti_required: Vec<LabelTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub pod_group: String,
    pub sub_group: Option<String>,
    pub requirements: ResourceRequirements,
    pub status: PodStatus,
    /// Set while the pod is speculatively evicted inside a cycle.
    pub virtual_status: bool,
    pub node_name: Option<String>,
    /// GPU groups for shared-GPU accounting; empty until placed.
    pub gpu_groups: Vec<String>,
    pub owned_claims: Vec<String>,
    pub all_claims: Vec<String>,
    pub dra_claims: Vec<DraClaimRef>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub labels: BTreeMap<String, String>,
    pub affinity: Option<PodAffinityTerms>,
    pub nominated_node: Option<String>,
    pub creation_timestamp: DateTime<Utc>,
    pub running_since: Option<DateTime<Utc>>,
    pub eviction: Option<EvictionRecord>,
}

impl PodInfo {
    pub fn new(name: &str, pod_group: &str, requirements: ResourceRequirements) -> Self {
        Self {
            name: name.to_string(),
            pod_group: pod_group.to_string(),
            sub_group: None,
            requirements,
            status: PodStatus::Pending,
            virtual_status: false,
            node_name: None,
            gpu_groups: Vec::new(),
            owned_claims: Vec::new(),
            all_claims: Vec::new(),
            dra_claims: Vec::new(),
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            labels: BTreeMap::new(),
            affinity: None,
            nominated_node: None,
            creation_timestamp: Utc::now(),
            running_since: None,
            eviction: None,
        }
    }

    /// Builds the info record from the wire object. The pod-group reference
    /// and sub-group come from annotations.
    pub fn from_resource(pod: &PodResource) -> Self {
        let meta = &pod.metadata;
        let requirements = ResourceRequirements::from_pod_spec(&pod.spec, &meta.annotations);
        let pod_group = meta
            .annotations
            .get(annotations::POD_GROUP)
            .cloned()
            .unwrap_or_default();

        let status = match (pod.spec.scheduling_gated, &pod.spec.node_name, pod.status.phase) {
            (true, _, _) => PodStatus::Gated,
            (_, _, PodPhase::Succeeded) => PodStatus::Succeeded,
            (_, _, PodPhase::Failed) => PodStatus::Failed,
            (_, Some(_), PodPhase::Running) => PodStatus::Running,
            (_, Some(_), _) => PodStatus::Bound,
            (_, None, PodPhase::Unknown) => PodStatus::Unknown,
            (_, None, _) => PodStatus::Pending,
        };

        let gpu_groups = meta
            .annotations
            .get(annotations::GPU_GROUP)
            .map(|tags| tags.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            sub_group: meta.annotations.get(annotations::SUB_GROUP).cloned(),
            node_name: pod.spec.node_name.clone(),
            gpu_groups,
            owned_claims: pod.spec.owned_claims.clone(),
            all_claims: pod.spec.claims.clone(),
            node_selector: pod.spec.node_selector.clone(),
            tolerations: pod.spec.tolerations.clone(),
            labels: meta.labels.clone(),
            nominated_node: pod.status.nominated_node_name.clone(),
            creation_timestamp: meta.creation_timestamp.unwrap_or_else(Utc::now),
            status,
            ..Self::new(&meta.name, &pod_group, requirements)
        }
    }

    pub fn sub_group_key(&self) -> &str {
        self.sub_group.as_deref().unwrap_or(DEFAULT_SUB_GROUP)
    }

    /// The pod currently holds resources on its node.
    pub fn occupies_node(&self) -> bool {
        matches!(
            self.status,
            PodStatus::Allocated
                | PodStatus::Pipelined
                | PodStatus::Binding
                | PodStatus::Bound
                | PodStatus::Running
        )
    }

    /// Counts toward the gang threshold.
    pub fn is_gang_member(&self) -> bool {
        self.occupies_node()
    }

    /// Eligible as a preemption or reclaim victim: actually holding
    /// resources, not already on the way out.
    pub fn is_victim_candidate(&self) -> bool {
        matches!(
            self.status,
            PodStatus::Binding | PodStatus::Bound | PodStatus::Running | PodStatus::Allocated
        ) && !self.virtual_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::meta::ObjectMeta;

    #[test]
    fn test_from_resource_pending() {
        let mut meta = ObjectMeta::named("job-0");
        meta.annotations
            .insert(annotations::POD_GROUP.to_string(), "group-a".to_string());
        meta.annotations
            .insert(annotations::SUB_GROUP.to_string(), "workers".to_string());
        let pod = PodResource {
            metadata: meta,
            ..Default::default()
        };
        let info = PodInfo::from_resource(&pod);
        assert_eq!(info.pod_group, "group-a");
        assert_eq!(info.sub_group_key(), "workers");
        assert_eq!(info.status, PodStatus::Pending);
        assert!(!info.occupies_node());
    }

    #[test]
    fn test_from_resource_bound_has_node() {
        let pod = PodResource {
            metadata: ObjectMeta::named("job-1"),
            spec: common::pod::PodSpec {
                node_name: Some("node-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let info = PodInfo::from_resource(&pod);
        assert_eq!(info.status, PodStatus::Bound);
        assert_eq!(info.node_name.as_deref(), Some("node-1"));
        assert!(info.occupies_node());
    }

    #[test]
    fn test_gated_pod() {
        let pod = PodResource {
            metadata: ObjectMeta::named("gated"),
            spec: common::pod::PodSpec {
                scheduling_gated: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(PodInfo::from_resource(&pod).status, PodStatus::Gated);
    }
}
