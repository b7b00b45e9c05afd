//! The per-cycle action pipeline: allocate, consolidation, reclaim,
//! preempt, stale-gang eviction and requeue, serially composed in the
//! configured order. Every action speculates inside statements and either
//! commits a gang-complete result or rolls the whole group back.

mod allocate;
mod consolidation;
mod preempt;
mod reclaim;
mod requeue;
mod stalegang;

pub use allocate::AllocateAction;
pub use consolidation::ConsolidationAction;
pub use preempt::PreemptAction;
pub use reclaim::ReclaimAction;
pub use requeue::RequeueAction;
pub use stalegang::StaleGangAction;

use std::collections::BTreeMap;

use log::debug;

use crate::cycle_state::CycleState;
use crate::fit_error::{FitErrorHistogram, SchedulerError};
use crate::info::{PodInfo, PodStatus};
use crate::resources::ResourceVector;
use crate::session::{Extensions, Session};
use crate::snapshot::ClusterSnapshot;

pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, session: &mut Session);
}

pub struct ActionRegistry {
    actions: BTreeMap<String, Box<dyn Action>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ActionRegistry {
    pub fn builtin() -> Self {
        let mut actions: BTreeMap<String, Box<dyn Action>> = BTreeMap::new();
        for action in [
            Box::new(AllocateAction) as Box<dyn Action>,
            Box::new(ConsolidationAction),
            Box::new(ReclaimAction),
            Box::new(PreemptAction),
            Box::new(StaleGangAction),
            Box::new(RequeueAction),
        ] {
            actions.insert(action.name().to_string(), action);
        }
        Self { actions }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Action> {
        self.actions.get(name).map(|action| action.as_ref())
    }
}

/// Runs the session's configured actions in order. An unknown action name
/// is fatal for the cycle.
pub fn run_actions(session: &mut Session, registry: &ActionRegistry) -> Result<(), SchedulerError> {
    for name in session.config.action_names() {
        let action = registry
            .get(&name)
            .ok_or_else(|| SchedulerError::UnknownAction(name.clone()))?;
        debug!("running action {name}");
        action.execute(session);
    }
    Ok(())
}

/// Queues that still have pending work, least saturated first, so the
/// furthest-below-fair-share queue gets the first shot.
pub(crate) fn queues_by_fairness(session: &Session) -> Vec<String> {
    let mut queues: Vec<String> = session
        .snapshot
        .pod_groups
        .values()
        .filter(|group| {
            session
                .snapshot
                .group_pods(&group.name)
                .iter()
                .any(|pod| pod.status == PodStatus::Pending)
        })
        .map(|group| group.queue.clone())
        .collect();
    queues.sort();
    queues.dedup();
    queues.sort_by(|a, b| {
        let sat_a = saturation_of(session, a);
        let sat_b = saturation_of(session, b);
        sat_a
            .partial_cmp(&sat_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    queues
}

fn saturation_of(session: &Session, queue: &str) -> f64 {
    session
        .ext
        .queue_metrics(queue)
        .map(|metrics| metrics.saturation())
        .unwrap_or(0.0)
}

/// Pending jobs of one queue in JobOrderFn order, capped at the action's
/// queue depth.
pub(crate) fn pending_jobs(session: &Session, queue: &str, action: &str) -> Vec<String> {
    let mut jobs: Vec<String> = session
        .snapshot
        .pod_groups
        .values()
        .filter(|group| group.queue == queue)
        .filter(|group| {
            session
                .snapshot
                .group_pods(&group.name)
                .iter()
                .any(|pod| pod.status == PodStatus::Pending)
        })
        .map(|group| group.name.clone())
        .collect();
    jobs.sort_by(|a, b| {
        session
            .ext
            .job_order(&session.snapshot.pod_groups[a], &session.snapshot.pod_groups[b])
    });
    if let Some(depth) = session.config.queue_depth(action) {
        jobs.truncate(depth);
    }
    jobs
}

/// The pending pods a group needs to cross its gang thresholds: sub-group
/// requirements first (in sub-group order), then the group-level
/// min-available. A group already gang-satisfied grows elastically with
/// everything still pending.
pub(crate) fn tasks_to_allocate(session: &Session, group_name: &str) -> Vec<String> {
    let snapshot = &session.snapshot;
    let Some(group) = snapshot.pod_groups.get(group_name) else {
        return Vec::new();
    };

    let mut pending: Vec<&PodInfo> = snapshot
        .group_pods(group_name)
        .into_iter()
        .filter(|pod| pod.status == PodStatus::Pending)
        .collect();
    pending.sort_by(|a, b| session.ext.task_order(a, b));

    if snapshot.is_gang_satisfied(group_name) {
        return pending.into_iter().map(|pod| pod.name.clone()).collect();
    }

    let mut chosen: Vec<String> = Vec::new();
    for view in session.sub_group_views(group) {
        let needed = view.min_available.saturating_sub(view.members) as usize;
        let takes: Vec<String> = pending
            .iter()
            .filter(|pod| pod.sub_group_key() == view.name && !chosen.contains(&pod.name))
            .take(needed)
            .map(|pod| pod.name.clone())
            .collect();
        chosen.extend(takes);
    }

    let members = snapshot.group_member_count(group_name) as usize;
    let group_needed = (group.min_available as usize).saturating_sub(members + chosen.len());
    let extras: Vec<String> = pending
        .iter()
        .filter(|pod| !chosen.contains(&pod.name))
        .take(group_needed)
        .map(|pod| pod.name.clone())
        .collect();
    chosen.extend(extras);
    chosen
}

pub(crate) fn demand_of(snapshot: &ClusterSnapshot, tasks: &[String]) -> ResourceVector {
    let mut demand = ResourceVector::new();
    for task in tasks {
        if let Some(pod) = snapshot.pods.get(task) {
            demand.add_assign(&pod.requirements.vector);
        }
    }
    demand
}

/// Picks the best-scoring node of one candidate set that passes every
/// predicate. `allow_pipelining` lets a node qualify on capacity that is
/// still releasing; predicate failures land in the histogram.
pub(crate) fn find_node_in_set(
    ext: &Extensions,
    snapshot: &ClusterSnapshot,
    pod: &PodInfo,
    state: &mut CycleState,
    candidates: &[String],
    allow_pipelining: bool,
    histogram: &mut FitErrorHistogram,
) -> Option<String> {
    let nodes: Vec<&crate::info::NodeInfo> = candidates
        .iter()
        .filter_map(|name| snapshot.nodes.get(name))
        .collect();
    ext.run_node_pre_order(state, pod, &nodes);

    let mut best: Option<(f64, &str)> = None;
    for node in &nodes {
        if let Err(fit) = ext.run_predicates(state, pod, node) {
            let resource_only = fit
                .reasons
                .iter()
                .all(|r| matches!(r, crate::fit_error::FitReason::InsufficientResource { .. }));
            if !(allow_pipelining && resource_only && node.fit_errors(pod, true).is_empty()) {
                histogram.add(&fit);
                continue;
            }
        }
        let score = ext.node_score(state, pod, node);
        let better = match best {
            None => true,
            Some((best_score, best_name)) => {
                score > best_score || (score == best_score && node.name.as_str() < best_name)
            }
        };
        if better {
            best = Some((score, node.name.as_str()));
        }
    }
    best.map(|(_, name)| name.to_string())
}

/// Victim candidates sorted ascending by group priority, then resource
/// footprint, then name: the cheapest disruption first.
pub(crate) fn sort_victims(snapshot: &ClusterSnapshot, victims: &mut Vec<String>) {
    victims.sort_by(|a, b| {
        let pa = &snapshot.pods[a];
        let pb = &snapshot.pods[b];
        let prio_a = snapshot
            .pod_groups
            .get(&pa.pod_group)
            .map(|g| g.priority)
            .unwrap_or(0);
        let prio_b = snapshot
            .pod_groups
            .get(&pb.pod_group)
            .map(|g| g.priority)
            .unwrap_or(0);
        prio_a
            .cmp(&prio_b)
            .then_with(|| {
                footprint(&pa.requirements.vector)
                    .partial_cmp(&footprint(&pb.requirements.vector))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.cmp(b))
    });
}

fn footprint(vector: &ResourceVector) -> f64 {
    vector.iter().map(|(_, v)| v).sum()
}

/// Greedy prefix of victims whose combined release covers the demand.
pub(crate) fn cover_demand(
    snapshot: &ClusterSnapshot,
    victims: &[String],
    demand: &ResourceVector,
) -> Option<usize> {
    let mut released = ResourceVector::new();
    for (count, victim) in victims.iter().enumerate() {
        released.add_assign(&snapshot.pods[victim].requirements.vector);
        if demand.less_equal(&released) {
            return Some(count + 1);
        }
    }
    None
}
