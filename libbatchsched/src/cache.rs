//! Durable mirror of the platform state. Informers feed it between
//! cycles; `snapshot` serializes a consistent per-cycle view. The cache is
//! the only shared mutable state in the scheduler; the core never touches
//! it once a snapshot is taken.

use std::collections::{HashMap, VecDeque};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use common::annotations;
use common::bindrequest::BindRequest;
use common::node::NodeResource;
use common::pod::PodResource;
use common::podgroup::{PodGroup, SchedulingCondition};
use common::queue::Queue;
use common::topology::Topology;

use crate::commit::CommitRequest;
use crate::info::{NodeInfo, PodGroupInfo, PodInfo, QueueInfo, TopologyInfo};
use crate::resources::ResourceVector;
use crate::snapshot::ClusterSnapshot;

pub const DEFAULT_USAGE_WINDOW: usize = 10;

bitflags! {
    /// Object kinds touched since the last snapshot; lets the daemon wake
    /// up early instead of waiting out the full schedule period.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyKinds: u32 {
        const PODS = 1;
        const NODES = 1 << 1;
        const POD_GROUPS = 1 << 2;
        const QUEUES = 1 << 3;
        const TOPOLOGIES = 1 << 4;
    }
}

pub struct Cache {
    pods: HashMap<String, PodResource>,
    nodes: HashMap<String, NodeResource>,
    pod_groups: HashMap<String, PodGroup>,
    queues: HashMap<String, Queue>,
    topologies: HashMap<String, Topology>,
    /// When each group was first observed holding a partial allocation.
    partial_marks: HashMap<String, DateTime<Utc>>,
    usage_window: HashMap<String, VecDeque<ResourceVector>>,
    window_size: usize,
    dirty: DirtyKinds,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(DEFAULT_USAGE_WINDOW)
    }
}

impl Cache {
    pub fn new(window_size: usize) -> Self {
        Self {
            pods: HashMap::new(),
            nodes: HashMap::new(),
            pod_groups: HashMap::new(),
            queues: HashMap::new(),
            topologies: HashMap::new(),
            partial_marks: HashMap::new(),
            usage_window: HashMap::new(),
            window_size: window_size.max(1),
            dirty: DirtyKinds::empty(),
        }
    }

    pub fn update_pod(&mut self, pod: PodResource) {
        self.pods.insert(pod.metadata.name.clone(), pod);
        self.dirty |= DirtyKinds::PODS;
    }

    pub fn remove_pod(&mut self, name: &str) {
        self.pods.remove(name);
        self.dirty |= DirtyKinds::PODS;
    }

    pub fn update_node(&mut self, node: NodeResource) {
        self.nodes.insert(node.metadata.name.clone(), node);
        self.dirty |= DirtyKinds::NODES;
    }

    pub fn remove_node(&mut self, name: &str) {
        self.nodes.remove(name);
        self.dirty |= DirtyKinds::NODES;
    }

    pub fn update_pod_group(&mut self, group: PodGroup) {
        self.pod_groups.insert(group.metadata.name.clone(), group);
        self.dirty |= DirtyKinds::POD_GROUPS;
    }

    pub fn remove_pod_group(&mut self, name: &str) {
        self.pod_groups.remove(name);
        self.partial_marks.remove(name);
        self.dirty |= DirtyKinds::POD_GROUPS;
    }

    pub fn update_queue(&mut self, queue: Queue) {
        self.queues.insert(queue.metadata.name.clone(), queue);
        self.dirty |= DirtyKinds::QUEUES;
    }

    pub fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.dirty |= DirtyKinds::QUEUES;
    }

    pub fn update_topology(&mut self, topology: Topology) {
        self.topologies
            .insert(topology.metadata.name.clone(), topology);
        self.dirty |= DirtyKinds::TOPOLOGIES;
    }

    /// Reconciles a completed BindRequest back into the pod mirror, as the
    /// binder's status would arrive through a watch.
    pub fn observe_bind(&mut self, bind: &BindRequest) {
        if let Some(pod) = self.pods.get_mut(&bind.spec.pod_name) {
            pod.spec.node_name = Some(bind.spec.selected_node.clone());
            self.dirty |= DirtyKinds::PODS;
        }
    }

    pub fn dirty(&self) -> DirtyKinds {
        self.dirty
    }

    /// Applies committed effects to the mirror. In a full deployment the
    /// informers deliver these; the daemon's self-contained mode and the
    /// tests short-circuit through here.
    pub fn reconcile(&mut self, requests: &[CommitRequest]) {
        for request in requests {
            match request {
                CommitRequest::Bind {
                    pod, node, gpu_groups, ..
                } => {
                    if let Some(p) = self.pods.get_mut(pod) {
                        p.spec.node_name = Some(node.clone());
                        if !gpu_groups.is_empty() {
                            p.metadata.annotations.insert(
                                annotations::GPU_GROUP.to_string(),
                                gpu_groups.join(","),
                            );
                        }
                        self.dirty |= DirtyKinds::PODS;
                    }
                }
                CommitRequest::Evict { pod, .. } => {
                    // Delete with grace; owned claims go with the pod.
                    self.pods.remove(pod);
                    self.dirty |= DirtyKinds::PODS;
                }
                CommitRequest::PodCondition { .. } => {}
                CommitRequest::GroupCondition {
                    group,
                    reason,
                    message,
                } => {
                    if let Some(g) = self.pod_groups.get_mut(group) {
                        g.status.scheduling_conditions.push(SchedulingCondition {
                            reason: reason.clone(),
                            message: message.clone(),
                            transition_time: Some(Utc::now()),
                        });
                    }
                }
                CommitRequest::GroupAnnotation { group, key, value } => {
                    if let Some(g) = self.pod_groups.get_mut(group) {
                        g.metadata
                            .annotations
                            .insert(key.clone(), value.clone());
                        self.dirty |= DirtyKinds::POD_GROUPS;
                    }
                }
            }
        }
    }

    /// Builds the per-cycle view: fresh info entities, node accounting
    /// replayed from bound pods, usage window advanced, partial-allocation
    /// marks carried over.
    pub fn snapshot(&mut self) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::new();

        for node in self.nodes.values() {
            let info = NodeInfo::from_resource(node);
            snapshot.total_resource.add_assign(&info.allocatable);
            snapshot.nodes.insert(info.name.clone(), info);
        }

        for queue in self.queues.values() {
            let info = QueueInfo::from_resource(queue);
            snapshot.queues.insert(info.name.clone(), info);
        }

        for topology in self.topologies.values() {
            let info = TopologyInfo::from_resource(topology);
            snapshot.topologies.insert(info.name.clone(), info);
        }

        for group in self.pod_groups.values() {
            let info = PodGroupInfo::from_resource(group);
            if !snapshot.queues.contains_key(&info.queue) {
                warn!(
                    "pod group {} references unknown queue {}; creating an unbounded one",
                    info.name, info.queue
                );
                snapshot
                    .queues
                    .insert(info.queue.clone(), QueueInfo::new(&info.queue, None));
            }
            snapshot.pod_groups.insert(info.name.clone(), info);
        }

        for pod in self.pods.values() {
            let info = PodInfo::from_resource(pod);
            match snapshot.pod_groups.get_mut(&info.pod_group) {
                Some(group) => {
                    group.pod_names.insert(info.name.clone());
                }
                None => {
                    debug!(
                        "pod {} has no pod group ({:?}); not schedulable this cycle",
                        info.name, info.pod_group
                    );
                    continue;
                }
            }
            if info.occupies_node()
                && let Some(node_name) = info.node_name.clone()
            {
                match snapshot.nodes.get_mut(&node_name) {
                    Some(node) => node.add_task(&info),
                    None => warn!("pod {} is bound to unknown node {node_name}", info.name),
                }
            }
            snapshot.pods.insert(info.name.clone(), info);
        }

        self.advance_partial_marks(&mut snapshot);
        self.advance_usage_window(&snapshot);
        snapshot.usage_window = self.usage_window.clone();
        self.dirty = DirtyKinds::empty();
        snapshot
    }

    fn advance_partial_marks(&mut self, snapshot: &mut ClusterSnapshot) {
        let now = Utc::now();
        let names: Vec<String> = snapshot.pod_groups.keys().cloned().collect();
        for name in names {
            if snapshot.is_partially_allocated(&name) {
                let mark = *self.partial_marks.entry(name.clone()).or_insert(now);
                if let Some(group) = snapshot.pod_groups.get_mut(&name) {
                    group.partial_since = Some(mark);
                }
            } else {
                self.partial_marks.remove(&name);
            }
        }
    }

    fn advance_usage_window(&mut self, snapshot: &ClusterSnapshot) {
        for queue in snapshot.queues.keys() {
            let (preemptible, non_preemptible) = snapshot.queue_allocated(queue);
            let usage = preemptible.plus(&non_preemptible);
            let window = self.usage_window.entry(queue.clone()).or_default();
            window.push_back(usage);
            while window.len() > self.window_size {
                window.pop_front();
            }
        }
        self.usage_window
            .retain(|queue, _| snapshot.queues.contains_key(queue));
    }
}
