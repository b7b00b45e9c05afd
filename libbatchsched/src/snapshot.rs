//! The per-cycle view of the cluster. Produced by the cache, mutated in
//! place by statement operations, discarded at session close. All cross
//! references are ids; navigation goes through the maps here.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::info::{NodeInfo, PodGroupInfo, PodInfo, PodStatus, QueueInfo, TopologyInfo};
use crate::resources::ResourceVector;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub pods: HashMap<String, PodInfo>,
    pub nodes: HashMap<String, NodeInfo>,
    pub pod_groups: HashMap<String, PodGroupInfo>,
    pub queues: HashMap<String, QueueInfo>,
    pub topologies: HashMap<String, TopologyInfo>,
    pub total_resource: ResourceVector,
    /// Per-queue absolute usage over the trailing window, fed to the
    /// fairness damping.
    pub usage_window: HashMap<String, VecDeque<ResourceVector>>,
}

impl ClusterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pods of a group, sorted by name for deterministic iteration.
    pub fn group_pods(&self, group: &str) -> Vec<&PodInfo> {
        let Some(group_info) = self.pod_groups.get(group) else {
            return Vec::new();
        };
        group_info
            .pod_names
            .iter()
            .filter_map(|name| self.pods.get(name))
            .collect()
    }

    pub fn group_member_count(&self, group: &str) -> u32 {
        self.group_pods(group)
            .iter()
            .filter(|pod| pod.is_gang_member())
            .count() as u32
    }

    pub fn sub_group_member_count(&self, group: &str, sub_group: &str) -> u32 {
        self.group_pods(group)
            .iter()
            .filter(|pod| pod.is_gang_member() && pod.sub_group_key() == sub_group)
            .count() as u32
    }

    /// A group is gang-satisfied when its member count crosses
    /// min-available and every sub-group crosses its own threshold.
    pub fn is_gang_satisfied(&self, group: &str) -> bool {
        let Some(group_info) = self.pod_groups.get(group) else {
            return false;
        };
        if self.group_member_count(group) < group_info.min_available {
            return false;
        }
        group_info.sub_groups.values().all(|sg| {
            self.sub_group_member_count(group, &sg.name) >= sg.min_available
        })
    }

    pub fn is_partially_allocated(&self, group: &str) -> bool {
        let members = self.group_member_count(group);
        members > 0 && !self.is_gang_satisfied(group)
    }

    pub fn groups_in_queue(&self, queue: &str) -> Vec<&PodGroupInfo> {
        self.pod_groups
            .values()
            .filter(|group| group.queue == queue)
            .collect()
    }

    pub fn queue_children(&self, queue: &str) -> Vec<&QueueInfo> {
        self.queues
            .values()
            .filter(|q| q.parent.as_deref() == Some(queue))
            .collect()
    }

    /// Ancestors from the queue's parent up to the root.
    pub fn queue_ancestors(&self, queue: &str) -> Vec<&QueueInfo> {
        let mut out = Vec::new();
        let mut current = self.queues.get(queue).and_then(|q| q.parent.clone());
        while let Some(name) = current {
            match self.queues.get(&name) {
                Some(q) => {
                    current = q.parent.clone();
                    out.push(q);
                }
                None => break,
            }
        }
        out
    }

    /// Queues of the subtree rooted at `queue`, itself included.
    pub fn queue_subtree(&self, queue: &str) -> Vec<String> {
        let mut out = vec![queue.to_string()];
        let mut frontier = vec![queue.to_string()];
        while let Some(next) = frontier.pop() {
            for child in self.queue_children(&next) {
                out.push(child.name.clone());
                frontier.push(child.name.clone());
            }
        }
        out
    }

    /// Currently held resources of a queue's subtree, split into the
    /// preemptible and non-preemptible buckets.
    pub fn queue_allocated(&self, queue: &str) -> (ResourceVector, ResourceVector) {
        let subtree = self.queue_subtree(queue);
        let mut preemptible = ResourceVector::new();
        let mut non_preemptible = ResourceVector::new();
        for group in self.pod_groups.values() {
            if !subtree.iter().any(|q| q == &group.queue) {
                continue;
            }
            let bucket = if group.preemptible {
                &mut preemptible
            } else {
                &mut non_preemptible
            };
            for pod in self.group_pods(&group.name) {
                if pod.occupies_node() {
                    bucket.add_assign(&pod.requirements.vector);
                }
            }
        }
        (preemptible, non_preemptible)
    }

    /// Total demand of a queue's subtree: everything its pods hold or still
    /// ask for.
    pub fn queue_request(&self, queue: &str) -> ResourceVector {
        let subtree = self.queue_subtree(queue);
        let mut request = ResourceVector::new();
        for group in self.pod_groups.values() {
            if !subtree.iter().any(|q| q == &group.queue) {
                continue;
            }
            for pod in self.group_pods(&group.name) {
                if pod.occupies_node() || pod.status == PodStatus::Pending {
                    request.add_assign(&pod.requirements.vector);
                }
            }
        }
        request
    }

    /// Node names sorted for deterministic candidate iteration.
    pub fn node_names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn sum_requirements<'a>(pods: impl IntoIterator<Item = &'a PodInfo>) -> ResourceVector {
        let mut sum = ResourceVector::new();
        for pod in pods {
            sum.add_assign(&pod.requirements.vector);
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::SubGroupInfo;
    use crate::resources::{ResourceRequirements, CPU};

    fn pod(name: &str, group: &str, status: PodStatus) -> PodInfo {
        let mut v = ResourceVector::one_pod();
        v.set(CPU, 1000.0);
        let mut pod = PodInfo::new(name, group, ResourceRequirements::new(v));
        pod.status = status;
        if pod.occupies_node() {
            pod.node_name = Some("node-1".to_string());
        }
        pod
    }

    fn snapshot_with_group(min_available: u32, statuses: &[PodStatus]) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::new();
        let mut group = PodGroupInfo::new("g1", "default", min_available);
        for (i, status) in statuses.iter().enumerate() {
            let name = format!("g1-{i}");
            group.pod_names.insert(name.clone());
            snapshot.pods.insert(name.clone(), pod(&name, "g1", *status));
        }
        snapshot.pod_groups.insert("g1".to_string(), group);
        snapshot
    }

    #[test]
    fn test_gang_satisfaction() {
        let snapshot =
            snapshot_with_group(2, &[PodStatus::Running, PodStatus::Allocated, PodStatus::Pending]);
        assert!(snapshot.is_gang_satisfied("g1"));
        assert!(!snapshot.is_partially_allocated("g1"));

        let partial = snapshot_with_group(2, &[PodStatus::Running, PodStatus::Pending]);
        assert!(!partial.is_gang_satisfied("g1"));
        assert!(partial.is_partially_allocated("g1"));
    }

    #[test]
    fn test_sub_group_threshold_blocks_gang() {
        let mut snapshot =
            snapshot_with_group(1, &[PodStatus::Running, PodStatus::Pending]);
        let group = snapshot.pod_groups.get_mut("g1").unwrap();
        group.sub_groups.insert(
            "workers".to_string(),
            SubGroupInfo {
                name: "workers".to_string(),
                min_available: 1,
            },
        );
        snapshot.pods.get_mut("g1-1").unwrap().sub_group = Some("workers".to_string());
        // The running pod is in the default sub-group; workers has none.
        assert!(!snapshot.is_gang_satisfied("g1"));
    }

    #[test]
    fn test_queue_ancestors_and_subtree() {
        let mut snapshot = ClusterSnapshot::new();
        snapshot
            .queues
            .insert("root".to_string(), QueueInfo::new("root", None));
        snapshot
            .queues
            .insert("a".to_string(), QueueInfo::new("a", Some("root")));
        snapshot
            .queues
            .insert("a1".to_string(), QueueInfo::new("a1", Some("a")));

        let ancestors: Vec<&str> = snapshot
            .queue_ancestors("a1")
            .iter()
            .map(|q| q.name.as_str())
            .collect();
        assert_eq!(ancestors, vec!["a", "root"]);

        let mut subtree = snapshot.queue_subtree("root");
        subtree.sort();
        assert_eq!(subtree, vec!["a", "a1", "root"]);
    }
}
