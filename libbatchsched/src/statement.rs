//! Speculative mutation of the snapshot with exact rollback.
//!
//! Every operation captures the full prior state of the pod and node it
//! touches before applying, and appends the inverse to a log. The snapshot
//! is mutated immediately so predicates later in the same action evaluate
//! the tentative world; correctness comes from the log, not immutability.
//! Nothing durable changes until `commit` hands requests to the commit
//! layer.

use std::sync::Arc;

use chrono::Utc;
use log::debug;
use thiserror::Error;

use crate::commit::CommitRequest;
use crate::events::EventReason;
use crate::info::{NodeInfo, PodInfo, PodStatus};
use crate::resources::ResourceVector;
use crate::snapshot::ClusterSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Error)]
pub enum StatementError {
    #[error("pod {0} not found in snapshot")]
    PodNotFound(String),
    #[error("node {0} not found in snapshot")]
    NodeNotFound(String),
    #[error("pod {pod}: cannot {op} from {from:?}")]
    InvalidTransition {
        pod: String,
        from: PodStatus,
        op: &'static str,
    },
}

/// Notification payload for accounting plugins.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub pod: String,
    pub pod_group: String,
    pub queue: String,
    pub preemptible: bool,
    pub requirement: ResourceVector,
}

/// Receives allocate/deallocate notifications; the fairness engine keeps
/// its queue buckets current through this. Handlers must be exactly
/// inverse to each other: rollback replays the opposite notification.
pub trait EventHandler: Send + Sync {
    fn on_allocate(&self, event: &TaskEvent);
    fn on_deallocate(&self, event: &TaskEvent);
}

enum FiredEvent {
    Allocate(TaskEvent),
    Deallocate(TaskEvent),
}

struct Record {
    pod_before: PodInfo,
    node_before: Option<(String, NodeInfo)>,
    event: Option<FiredEvent>,
    request: Option<CommitRequest>,
}

pub struct Statement<'a> {
    snapshot: &'a mut ClusterSnapshot,
    handlers: Vec<Arc<dyn EventHandler>>,
    commits: &'a mut Vec<CommitRequest>,
    log: Vec<Record>,
}

impl<'a> Statement<'a> {
    pub fn new(
        snapshot: &'a mut ClusterSnapshot,
        handlers: Vec<Arc<dyn EventHandler>>,
        commits: &'a mut Vec<CommitRequest>,
    ) -> Self {
        Self {
            snapshot,
            handlers,
            commits,
            log: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &ClusterSnapshot {
        self.snapshot
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Tentatively places a pending pod on a node. Shared-GPU pods without
    /// a group assignment get one picked on the node (binpack).
    pub fn allocate(&mut self, pod_name: &str, node_name: &str) -> Result<(), StatementError> {
        let pod_before = self.pod(pod_name)?.clone();
        if pod_before.status != PodStatus::Pending {
            return Err(StatementError::InvalidTransition {
                pod: pod_name.to_string(),
                from: pod_before.status,
                op: "allocate",
            });
        }
        if !self.snapshot.nodes.contains_key(node_name) {
            return Err(StatementError::NodeNotFound(node_name.to_string()));
        }
        let node_before = self.snapshot.nodes[node_name].clone();

        let mut pod = pod_before.clone();
        pod.status = PodStatus::Allocated;
        pod.node_name = Some(node_name.to_string());
        let node = self.snapshot.nodes.get_mut(node_name).unwrap();
        if pod.requirements.gpu.is_shared() && pod.gpu_groups.is_empty() {
            let memory = pod.requirements.gpu.shared_memory(node.gpu_memory);
            match node.pick_shared_group(memory, true) {
                Some(group) => pod.gpu_groups = vec![group],
                None => {
                    return Err(StatementError::InvalidTransition {
                        pod: pod_name.to_string(),
                        from: pod_before.status,
                        op: "allocate shared gpu",
                    });
                }
            }
        }
        node.add_task(&pod);

        let request = CommitRequest::Bind {
            pod: pod.name.clone(),
            node: node_name.to_string(),
            gpu_groups: pod.gpu_groups.clone(),
            wait_for_release: false,
        };
        let event = self.task_event(&pod);
        self.snapshot.pods.insert(pod.name.clone(), pod);
        self.fire_allocate(&event);
        self.log.push(Record {
            pod_before,
            node_before: Some((node_name.to_string(), node_before)),
            event: Some(FiredEvent::Allocate(event)),
            request: Some(request),
        });
        Ok(())
    }

    /// Places a pod against capacity a victim is still releasing. The bind
    /// is deferred until the victim is gone; `is_real` distinguishes actual
    /// placements from feasibility probes that must not reach the binder.
    pub fn pipeline(
        &mut self,
        pod_name: &str,
        node_name: &str,
        is_real: bool,
    ) -> Result<(), StatementError> {
        let pod_before = self.pod(pod_name)?.clone();
        if !matches!(pod_before.status, PodStatus::Pending | PodStatus::Releasing) {
            return Err(StatementError::InvalidTransition {
                pod: pod_name.to_string(),
                from: pod_before.status,
                op: "pipeline",
            });
        }
        if !self.snapshot.nodes.contains_key(node_name) {
            return Err(StatementError::NodeNotFound(node_name.to_string()));
        }
        let node_before = self.snapshot.nodes[node_name].clone();

        let mut pod = pod_before.clone();
        pod.status = PodStatus::Pipelined;
        pod.virtual_status = false;
        pod.node_name = Some(node_name.to_string());
        let node = self.snapshot.nodes.get_mut(node_name).unwrap();
        if pod.requirements.gpu.is_shared() && pod.gpu_groups.is_empty() {
            let memory = pod.requirements.gpu.shared_memory(node.gpu_memory);
            if let Some(group) = node.pick_shared_group(memory, true) {
                pod.gpu_groups = vec![group];
            }
        }
        node.pipeline_task(&pod);

        let request = is_real.then(|| CommitRequest::Bind {
            pod: pod.name.clone(),
            node: node_name.to_string(),
            gpu_groups: pod.gpu_groups.clone(),
            wait_for_release: true,
        });
        let event = self.task_event(&pod);
        self.snapshot.pods.insert(pod.name.clone(), pod);
        self.fire_allocate(&event);
        self.log.push(Record {
            pod_before,
            node_before: Some((node_name.to_string(), node_before)),
            event: Some(FiredEvent::Allocate(event)),
            request,
        });
        Ok(())
    }

    /// Speculatively evicts a placed pod: resources move from used to
    /// releasing, the pod turns virtual until commit makes it durable.
    pub fn evict(
        &mut self,
        pod_name: &str,
        reason: EventReason,
        message: &str,
    ) -> Result<(), StatementError> {
        let pod_before = self.pod(pod_name)?.clone();
        if !pod_before.occupies_node() {
            return Err(StatementError::InvalidTransition {
                pod: pod_name.to_string(),
                from: pod_before.status,
                op: "evict",
            });
        }
        let node_name = pod_before
            .node_name
            .clone()
            .ok_or_else(|| StatementError::NodeNotFound(String::new()))?;
        let node_before = self
            .snapshot
            .nodes
            .get(&node_name)
            .ok_or_else(|| StatementError::NodeNotFound(node_name.clone()))?
            .clone();

        let mut pod = pod_before.clone();
        pod.status = PodStatus::Releasing;
        pod.virtual_status = true;
        pod.eviction = Some(crate::info::EvictionRecord {
            reason: reason.clone(),
            message: message.to_string(),
        });
        self.snapshot
            .nodes
            .get_mut(&node_name)
            .unwrap()
            .release_task(&pod);

        let request = CommitRequest::Evict {
            pod: pod.name.clone(),
            reason,
            message: message.to_string(),
        };
        let event = self.task_event(&pod);
        self.snapshot.pods.insert(pod.name.clone(), pod);
        self.fire_deallocate(&event);
        self.log.push(Record {
            pod_before,
            node_before: Some((node_name, node_before)),
            event: Some(FiredEvent::Deallocate(event)),
            request: Some(request),
        });
        Ok(())
    }

    /// Re-associates a shared-GPU pod to another group on the same node.
    pub fn consolidate_shared(
        &mut self,
        pod_name: &str,
        target_group: &str,
    ) -> Result<(), StatementError> {
        let pod_before = self.pod(pod_name)?.clone();
        if !pod_before.occupies_node() || !pod_before.requirements.gpu.is_shared() {
            return Err(StatementError::InvalidTransition {
                pod: pod_name.to_string(),
                from: pod_before.status,
                op: "consolidate shared gpu",
            });
        }
        let node_name = pod_before
            .node_name
            .clone()
            .ok_or_else(|| StatementError::NodeNotFound(String::new()))?;
        let node_before = self
            .snapshot
            .nodes
            .get(&node_name)
            .ok_or_else(|| StatementError::NodeNotFound(node_name.clone()))?
            .clone();

        self.snapshot
            .nodes
            .get_mut(&node_name)
            .unwrap()
            .move_shared_task(&pod_before, target_group);
        let mut pod = pod_before.clone();
        pod.gpu_groups = vec![target_group.to_string()];

        let request = CommitRequest::Bind {
            pod: pod.name.clone(),
            node: node_name.clone(),
            gpu_groups: pod.gpu_groups.clone(),
            wait_for_release: false,
        };
        self.snapshot.pods.insert(pod.name.clone(), pod);
        self.log.push(Record {
            pod_before,
            node_before: Some((node_name, node_before)),
            event: None,
            request: Some(request),
        });
        Ok(())
    }

    /// Opaque token equal to the current log length.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.log.len())
    }

    /// Replays inverses in reverse order until the log shrinks to the
    /// token. Restores bitwise equality of all touched accounting.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        while self.log.len() > checkpoint.0 {
            let record = self.log.pop().unwrap();
            self.snapshot
                .pods
                .insert(record.pod_before.name.clone(), record.pod_before);
            if let Some((name, node)) = record.node_before {
                self.snapshot.nodes.insert(name, node);
            }
            match record.event {
                Some(FiredEvent::Allocate(event)) => self.fire_deallocate(&event),
                Some(FiredEvent::Deallocate(event)) => self.fire_allocate(&event),
                None => {}
            }
        }
    }

    pub fn rollback_all(&mut self) {
        self.rollback(Checkpoint(0));
    }

    /// Hands the accumulated requests to the commit layer and empties the
    /// log; subsequent actions in the same cycle observe the mutated
    /// snapshot. Stamps last-start on every group that just became fully
    /// allocated.
    pub fn commit(mut self) -> usize {
        let mut touched_groups = Vec::new();
        let count = self.log.len();
        for record in self.log.drain(..) {
            if let Some(request) = record.request {
                self.commits.push(request);
            }
            if !touched_groups.contains(&record.pod_before.pod_group) {
                touched_groups.push(record.pod_before.pod_group.clone());
            }
        }
        for group_name in touched_groups {
            if self.snapshot.is_gang_satisfied(&group_name)
                && let Some(group) = self.snapshot.pod_groups.get_mut(&group_name)
            {
                group.last_start_timestamp = Some(Utc::now());
            }
        }
        debug!("statement committed with {count} operation(s)");
        count
    }

    fn pod(&self, name: &str) -> Result<&PodInfo, StatementError> {
        self.snapshot
            .pods
            .get(name)
            .ok_or_else(|| StatementError::PodNotFound(name.to_string()))
    }

    fn task_event(&self, pod: &PodInfo) -> TaskEvent {
        let preemptible = self
            .snapshot
            .pod_groups
            .get(&pod.pod_group)
            .map(|g| g.preemptible)
            .unwrap_or(false);
        let queue = self
            .snapshot
            .pod_groups
            .get(&pod.pod_group)
            .map(|g| g.queue.clone())
            .unwrap_or_default();
        TaskEvent {
            pod: pod.name.clone(),
            pod_group: pod.pod_group.clone(),
            queue,
            preemptible,
            requirement: pod.requirements.vector.clone(),
        }
    }

    fn fire_allocate(&self, event: &TaskEvent) {
        for handler in &self.handlers {
            handler.on_allocate(event);
        }
    }

    fn fire_deallocate(&self, event: &TaskEvent) {
        for handler in &self.handlers {
            handler.on_deallocate(event);
        }
    }
}

impl Drop for Statement<'_> {
    /// An undropped speculative tail is a bug waiting to surface in the
    /// next action's predicates; discard means rollback.
    fn drop(&mut self) {
        if !self.log.is_empty() {
            debug!("statement dropped with {} uncommitted op(s)", self.log.len());
            self.rollback_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{NodeInfo, PodGroupInfo};
    use crate::resources::{ResourceRequirements, ResourceVector, CPU, GPU, PODS};
    use serial_test::serial;

    fn snapshot_fixture() -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::new();
        let mut allocatable = ResourceVector::new();
        allocatable.set(CPU, 8000.0);
        allocatable.set(GPU, 4.0);
        allocatable.set(PODS, 110.0);
        snapshot
            .nodes
            .insert("node-1".to_string(), NodeInfo::new("node-1", allocatable));

        let mut group = PodGroupInfo::new("g1", "q1", 1);
        for name in ["p1", "p2"] {
            let mut v = ResourceVector::one_pod();
            v.set(CPU, 1000.0);
            v.set(GPU, 1.0);
            let mut req = ResourceRequirements::new(v);
            req.gpu.count = 1;
            snapshot
                .pods
                .insert(name.to_string(), PodInfo::new(name, "g1", req));
            group.pod_names.insert(name.to_string());
        }
        snapshot.pod_groups.insert("g1".to_string(), group);
        snapshot
    }

    #[test]
    #[serial]
    fn test_allocate_then_rollback_restores_bitwise() {
        let mut snapshot = snapshot_fixture();
        let reference = snapshot.clone();
        let mut commits = Vec::new();
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);

        let cp = stmt.checkpoint();
        stmt.allocate("p1", "node-1").unwrap();
        stmt.allocate("p2", "node-1").unwrap();
        assert_eq!(stmt.snapshot().nodes["node-1"].idle.get(GPU), 2.0);
        stmt.rollback(cp);
        drop(stmt);

        assert_eq!(snapshot.nodes["node-1"].idle, reference.nodes["node-1"].idle);
        assert_eq!(snapshot.nodes["node-1"].used, reference.nodes["node-1"].used);
        assert_eq!(snapshot.pods["p1"].status, PodStatus::Pending);
        assert_eq!(snapshot.pods["p1"].node_name, None);
        assert!(commits.is_empty());
    }

    #[test]
    #[serial]
    fn test_commit_emits_bind_requests() {
        let mut snapshot = snapshot_fixture();
        let mut commits = Vec::new();
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
        stmt.allocate("p1", "node-1").unwrap();
        assert_eq!(stmt.commit(), 1);

        assert_eq!(commits.len(), 1);
        match &commits[0] {
            CommitRequest::Bind { pod, node, .. } => {
                assert_eq!(pod, "p1");
                assert_eq!(node, "node-1");
            }
            other => panic!("unexpected request {other:?}"),
        }
        // min-available is 1, so the group just started.
        assert!(snapshot.pod_groups["g1"].last_start_timestamp.is_some());
    }

    #[test]
    #[serial]
    fn test_evict_and_pipeline_conserve_resources() {
        let mut snapshot = snapshot_fixture();
        let mut commits = Vec::new();
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
        stmt.allocate("p1", "node-1").unwrap();
        stmt.commit();

        let mut commits = Vec::new();
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
        stmt.evict("p1", EventReason::PreemptedBy("g2".to_string()), "test")
            .unwrap();
        {
            let node = &stmt.snapshot().nodes["node-1"];
            assert_eq!(node.releasing.get(GPU), 1.0);
            let sum = node.idle.plus(&node.used).plus(&node.releasing);
            assert!(sum.less_equal(&node.allocatable) && node.allocatable.less_equal(&sum));
        }
        assert_eq!(stmt.snapshot().pods["p1"].status, PodStatus::Releasing);
        assert!(stmt.snapshot().pods["p1"].virtual_status);

        stmt.pipeline("p2", "node-1", true).unwrap();
        {
            let node = &stmt.snapshot().nodes["node-1"];
            assert_eq!(node.releasing.get(GPU), 0.0);
            let sum = node.idle.plus(&node.used).plus(&node.releasing);
            assert!(sum.less_equal(&node.allocatable) && node.allocatable.less_equal(&sum));
        }
        stmt.commit();
        assert!(matches!(
            commits.as_slice(),
            [CommitRequest::Evict { .. }, CommitRequest::Bind { wait_for_release: true, .. }]
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_transitions_are_rejected() {
        let mut snapshot = snapshot_fixture();
        let mut commits = Vec::new();
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
        assert!(stmt.evict("p1", EventReason::GangEvicted, "").is_err());
        stmt.allocate("p1", "node-1").unwrap();
        assert!(stmt.allocate("p1", "node-1").is_err());
        assert!(stmt.allocate("p2", "missing").is_err());
    }

    #[test]
    #[serial]
    fn test_drop_rolls_back_uncommitted_ops() {
        let mut snapshot = snapshot_fixture();
        let mut commits = Vec::new();
        {
            let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
            stmt.allocate("p1", "node-1").unwrap();
        }
        assert_eq!(snapshot.pods["p1"].status, PodStatus::Pending);
        assert!(commits.is_empty());
    }
}
