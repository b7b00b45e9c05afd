//! Per-cycle context: the snapshot, the plugin instances and the typed
//! slices of extension functions they contribute. Opened once per cycle,
//! closed in reverse registration order; committed effects leave through
//! the pending-commit queue when the session closes.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;

use crate::commit::CommitRequest;
use crate::config::SchedulerConfig;
use crate::cycle_state::CycleState;
use crate::events::SchedulingEvent;
use crate::fit_error::{
    AdmissionError, FitError, SchedulerError, SchedulingRejection, TopologyError,
};
use crate::info::{NodeInfo, PodGroupInfo, PodInfo};
use crate::plugins::PluginRegistry;
use crate::resources::ResourceVector;
use crate::snapshot::ClusterSnapshot;
use crate::statement::{EventHandler, Statement};

/// Computed fairness attributes of one queue, exposed by the fairness
/// engine to the actions.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub deserved: ResourceVector,
    pub fair_share: ResourceVector,
    pub allocated: ResourceVector,
    pub allocated_non_preemptible: ResourceVector,
    pub request: ResourceVector,
}

impl QueueMetrics {
    /// Largest per-resource allocated/fair-share ratio; how far the queue
    /// is into (or beyond) its entitlement.
    pub fn saturation(&self) -> f64 {
        let mut worst = 0.0_f64;
        for (i, share) in self.fair_share.iter() {
            if share > 0.0 {
                worst = worst.max(self.allocated.get(i) / share);
            } else if self.allocated.get(i) > 0.0 {
                return f64::INFINITY;
            }
        }
        worst
    }
}

/// Per-sub-group tallies handed to SubGroupOrderFn.
#[derive(Debug, Clone)]
pub struct SubGroupView {
    pub name: String,
    pub min_available: u32,
    pub members: u32,
    pub total: u32,
}

pub type JobOrderFn = Arc<dyn Fn(&PodGroupInfo, &PodGroupInfo) -> Ordering + Send + Sync>;
pub type TaskOrderFn = Arc<dyn Fn(&PodInfo, &PodInfo) -> Ordering + Send + Sync>;
pub type SubGroupOrderFn = Arc<dyn Fn(&SubGroupView, &SubGroupView) -> Ordering + Send + Sync>;
pub type NodeOrderFn = Arc<dyn Fn(&CycleState, &PodInfo, &NodeInfo) -> f64 + Send + Sync>;
pub type NodePreOrderFn = Arc<dyn Fn(&mut CycleState, &PodInfo, &[&NodeInfo]) + Send + Sync>;
pub type PredicateFn =
    Arc<dyn Fn(&CycleState, &PodInfo, &NodeInfo) -> Result<(), FitError> + Send + Sync>;
pub type PrePredicateFn = Arc<
    dyn Fn(&mut CycleState, &PodInfo, &PodGroupInfo) -> Result<(), SchedulingRejection>
        + Send
        + Sync,
>;
pub type ReclaimableFn =
    Arc<dyn Fn(&ClusterSnapshot, &PodGroupInfo, &[&PodInfo]) -> bool + Send + Sync>;
pub type PreemptableFn =
    Arc<dyn Fn(&ClusterSnapshot, &PodGroupInfo, &[&PodInfo]) -> bool + Send + Sync>;
pub type SubSetNodesFn = Arc<
    dyn Fn(&ClusterSnapshot, &PodGroupInfo, &[String]) -> Result<Option<Vec<Vec<String>>>, TopologyError>
        + Send
        + Sync,
>;
pub type RequeueCandidateFn =
    Arc<dyn Fn(&ClusterSnapshot, DateTime<Utc>) -> Vec<String> + Send + Sync>;
pub type CanReclaimResourcesFn = Arc<dyn Fn(&str, &ResourceVector) -> bool + Send + Sync>;
pub type JobOverCapacityFn =
    Arc<dyn Fn(&PodGroupInfo, &ResourceVector) -> Result<(), AdmissionError> + Send + Sync>;
pub type QueueMetricsFn = Arc<dyn Fn(&str) -> Option<QueueMetrics> + Send + Sync>;

/// The typed extension slices. Plugins push closures here during
/// `on_session_open`; invocation order equals registration order.
#[derive(Default, Clone)]
pub struct Extensions {
    pub job_order_fns: Vec<JobOrderFn>,
    pub task_order_fns: Vec<TaskOrderFn>,
    pub sub_group_order_fns: Vec<SubGroupOrderFn>,
    pub node_order_fns: Vec<NodeOrderFn>,
    pub node_pre_order_fns: Vec<NodePreOrderFn>,
    pub predicate_fns: Vec<PredicateFn>,
    pub pre_predicate_fns: Vec<PrePredicateFn>,
    pub reclaimable_fns: Vec<ReclaimableFn>,
    pub preemptable_fns: Vec<PreemptableFn>,
    pub subset_nodes_fns: Vec<SubSetNodesFn>,
    pub requeue_candidate_fns: Vec<RequeueCandidateFn>,
    pub can_reclaim_resources_fns: Vec<CanReclaimResourcesFn>,
    pub job_over_capacity_fns: Vec<JobOverCapacityFn>,
    pub queue_metrics_fns: Vec<QueueMetricsFn>,
    pub event_handlers: Vec<Arc<dyn EventHandler>>,
    /// Cooldown stamped on requeued groups, set by the requeue plugin.
    pub requeue_cooldown_seconds: i64,
}

impl Extensions {
    /// Total order over pod groups: first non-equal verdict wins, stable
    /// tie-break by id.
    pub fn job_order(&self, a: &PodGroupInfo, b: &PodGroupInfo) -> Ordering {
        for f in &self.job_order_fns {
            let order = f(a, b);
            if order != Ordering::Equal {
                return order;
            }
        }
        a.name.cmp(&b.name)
    }

    pub fn task_order(&self, a: &PodInfo, b: &PodInfo) -> Ordering {
        for f in &self.task_order_fns {
            let order = f(a, b);
            if order != Ordering::Equal {
                return order;
            }
        }
        a.name.cmp(&b.name)
    }

    pub fn sub_group_order(&self, a: &SubGroupView, b: &SubGroupView) -> Ordering {
        for f in &self.sub_group_order_fns {
            let order = f(a, b);
            if order != Ordering::Equal {
                return order;
            }
        }
        a.name.cmp(&b.name)
    }

    /// AND-combined, short-circuiting on the first failure.
    pub fn run_predicates(
        &self,
        state: &CycleState,
        pod: &PodInfo,
        node: &NodeInfo,
    ) -> Result<(), FitError> {
        for f in &self.predicate_fns {
            f(state, pod, node)?;
        }
        Ok(())
    }

    pub fn run_pre_predicates(
        &self,
        state: &mut CycleState,
        pod: &PodInfo,
        group: &PodGroupInfo,
    ) -> Result<(), SchedulingRejection> {
        for f in &self.pre_predicate_fns {
            f(state, pod, group)?;
        }
        Ok(())
    }

    pub fn run_node_pre_order(&self, state: &mut CycleState, pod: &PodInfo, nodes: &[&NodeInfo]) {
        for f in &self.node_pre_order_fns {
            f(state, pod, nodes);
        }
    }

    /// Scores sum across plugins; higher is better.
    pub fn node_score(&self, state: &CycleState, pod: &PodInfo, node: &NodeInfo) -> f64 {
        self.node_order_fns.iter().map(|f| f(state, pod, node)).sum()
    }

    /// First plugin that takes a stance on the group's candidate sets wins.
    pub fn subset_nodes(
        &self,
        snapshot: &ClusterSnapshot,
        group: &PodGroupInfo,
        all_nodes: &[String],
    ) -> Result<Option<Vec<Vec<String>>>, TopologyError> {
        for f in &self.subset_nodes_fns {
            if let Some(sets) = f(snapshot, group, all_nodes)? {
                return Ok(Some(sets));
            }
        }
        Ok(None)
    }

    pub fn reclaimable(
        &self,
        snapshot: &ClusterSnapshot,
        reclaimer: &PodGroupInfo,
        victims: &[&PodInfo],
    ) -> bool {
        self.reclaimable_fns
            .iter()
            .all(|f| f(snapshot, reclaimer, victims))
    }

    pub fn preemptable(
        &self,
        snapshot: &ClusterSnapshot,
        preemptor: &PodGroupInfo,
        victims: &[&PodInfo],
    ) -> bool {
        self.preemptable_fns
            .iter()
            .all(|f| f(snapshot, preemptor, victims))
    }

    pub fn can_reclaim_resources(&self, queue: &str, demand: &ResourceVector) -> bool {
        self.can_reclaim_resources_fns
            .iter()
            .all(|f| f(queue, demand))
    }

    pub fn job_over_capacity(
        &self,
        group: &PodGroupInfo,
        demand: &ResourceVector,
    ) -> Result<(), AdmissionError> {
        for f in &self.job_over_capacity_fns {
            f(group, demand)?;
        }
        Ok(())
    }

    pub fn requeue_candidates(&self, snapshot: &ClusterSnapshot, now: DateTime<Utc>) -> Vec<String> {
        let mut candidates = Vec::new();
        for f in &self.requeue_candidate_fns {
            for name in f(snapshot, now) {
                if !candidates.contains(&name) {
                    candidates.push(name);
                }
            }
        }
        candidates
    }

    pub fn queue_metrics(&self, queue: &str) -> Option<QueueMetrics> {
        self.queue_metrics_fns.iter().find_map(|f| f(queue))
    }
}

pub struct Session {
    pub snapshot: ClusterSnapshot,
    pub ext: Extensions,
    pub config: SchedulerConfig,
    pub pending_commits: Vec<CommitRequest>,
    pub events: Vec<SchedulingEvent>,
    plugins: Vec<Box<dyn crate::plugins::Plugin>>,
}

impl Session {
    /// Instantiates each plugin named in the configured tiers (unknown
    /// names are fatal), lets it register its extensions, and returns the
    /// ready session. Duplicate plugin names keep their first registration.
    pub fn open(
        snapshot: ClusterSnapshot,
        config: SchedulerConfig,
        registry: &PluginRegistry,
    ) -> Result<Self, SchedulerError> {
        let mut session = Session {
            snapshot,
            ext: Extensions::default(),
            config,
            pending_commits: Vec::new(),
            events: Vec::new(),
            plugins: Vec::new(),
        };

        if session.config.options.inference_preemptible {
            for group in session.snapshot.pod_groups.values_mut() {
                if !group.preemptible {
                    group.preemptible = true;
                }
            }
        }

        let tiers = session.config.tiers.clone();
        let mut seen = Vec::new();
        for tier in &tiers {
            for spec in &tier.plugins {
                if seen.contains(&spec.name) {
                    debug!("plugin {} already registered; keeping the first", spec.name);
                    continue;
                }
                seen.push(spec.name.clone());
                let mut plugin = registry.build(&spec.name, &spec.arguments)?;
                plugin.on_session_open(&mut session);
                session.plugins.push(plugin);
            }
        }
        debug!("session opened with {} plugin(s)", session.plugins.len());
        Ok(session)
    }

    /// A fresh statement bound to this session's snapshot and handlers.
    /// Actions that need the extension slices alongside the statement
    /// destructure the session instead.
    pub fn statement(&mut self) -> Statement<'_> {
        let Session {
            snapshot,
            ext,
            pending_commits,
            ..
        } = self;
        Statement::new(snapshot, ext.event_handlers.clone(), pending_commits)
    }

    pub fn record_event(&mut self, event: SchedulingEvent) {
        debug!(
            "event {:?} on {:?}: {}",
            event.reason, event.object, event.message
        );
        self.events.push(event);
    }

    /// Per-sub-group tallies for ordering, computed over the current
    /// (possibly tentative) snapshot.
    pub fn sub_group_views(&self, group: &PodGroupInfo) -> Vec<SubGroupView> {
        let mut views: Vec<SubGroupView> = Vec::new();
        let pods = self.snapshot.group_pods(&group.name);
        let mut keys: Vec<&str> = pods.iter().map(|pod| pod.sub_group_key()).collect();
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            let members = pods
                .iter()
                .filter(|pod| pod.is_gang_member() && pod.sub_group_key() == key)
                .count() as u32;
            let total = pods.iter().filter(|pod| pod.sub_group_key() == key).count() as u32;
            let min_available = group
                .sub_groups
                .get(key)
                .map(|sg| sg.min_available)
                .unwrap_or(0);
            views.push(SubGroupView {
                name: key.to_string(),
                min_available,
                members,
                total,
            });
        }
        views.sort_by(|a, b| self.ext.sub_group_order(a, b));
        views
    }

    /// Invokes `on_session_close` in reverse registration order and yields
    /// the committed requests and recorded events for flushing.
    pub fn close(mut self) -> (Vec<CommitRequest>, Vec<SchedulingEvent>) {
        let mut plugins = std::mem::take(&mut self.plugins);
        for plugin in plugins.iter_mut().rev() {
            plugin.on_session_close(&mut self);
        }
        debug!(
            "session closed with {} pending commit(s), {} event(s)",
            self.pending_commits.len(),
            self.events.len()
        );
        (self.pending_commits, self.events)
    }
}
