//! The fair-share and capacity engine.
//!
//! Runs once at session open, after snapshot assembly: aggregates quotas
//! and requests bottom-up over the queue tree, then divides the cluster
//! top-down by a damped weighted max-min. The resulting attributes back
//! every capacity predicate and the reclaim admission rules, and are kept
//! current during the cycle by allocate/deallocate notifications.

mod divide;

pub use divide::{damped_weight, divide_round_based};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::fit_error::AdmissionError;
use crate::plugins::{float_argument, Plugin, PluginArguments};
use crate::resources::{self, ResourceVector};
use crate::session::{QueueMetrics, Session};
use crate::statement::{EventHandler, TaskEvent};
use crate::fit_error::SchedulerError;
use crate::info::PodStatus;

const EPSILON: f64 = 1e-6;

pub const DEFAULT_K: f64 = 1.0;

/// Computed per-queue attributes for one cycle. `allocated` and `request`
/// aggregate the queue's whole subtree.
#[derive(Debug, Clone, Default)]
pub struct QueueAttributes {
    pub name: String,
    pub parent: Option<String>,
    pub quota: ResourceVector,
    pub weight: std::collections::BTreeMap<usize, f64>,
    pub limit: std::collections::BTreeMap<usize, f64>,
    pub deserved: ResourceVector,
    pub fair_share: ResourceVector,
    pub allocated: ResourceVector,
    pub allocated_non_preemptible: ResourceVector,
    pub request: ResourceVector,
}

impl QueueAttributes {
    fn weight_of(&self, index: usize) -> f64 {
        self.weight.get(&index).copied().unwrap_or(1.0)
    }

    fn limit_of(&self, index: usize) -> Option<f64> {
        self.limit.get(&index).copied()
    }

    fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            deserved: self.deserved.clone(),
            fair_share: self.fair_share.clone(),
            allocated: self.allocated.clone(),
            allocated_non_preemptible: self.allocated_non_preemptible.clone(),
            request: self.request.clone(),
        }
    }
}

struct EngineState {
    attrs: RwLock<HashMap<String, QueueAttributes>>,
    /// group -> (queue, preemptible) for event attribution.
    groups: RwLock<HashMap<String, (String, bool)>>,
}

impl EngineState {
    fn ancestor_chain(&self, queue: &str) -> Vec<String> {
        let attrs = self.attrs.read().unwrap();
        let mut chain = vec![queue.to_string()];
        let mut current = attrs.get(queue).and_then(|a| a.parent.clone());
        while let Some(parent) = current {
            current = attrs.get(&parent).and_then(|a| a.parent.clone());
            chain.push(parent);
        }
        chain
    }
}

impl EventHandler for EngineState {
    fn on_allocate(&self, event: &TaskEvent) {
        let chain = self.ancestor_chain(&event.queue);
        let mut attrs = self.attrs.write().unwrap();
        for queue in chain {
            if let Some(a) = attrs.get_mut(&queue) {
                a.allocated.add_assign(&event.requirement);
                if !event.preemptible {
                    a.allocated_non_preemptible.add_assign(&event.requirement);
                }
            }
        }
    }

    fn on_deallocate(&self, event: &TaskEvent) {
        let chain = self.ancestor_chain(&event.queue);
        let mut attrs = self.attrs.write().unwrap();
        for queue in chain {
            if let Some(a) = attrs.get_mut(&queue) {
                a.allocated.sub_assign(&event.requirement);
                a.allocated.clamp_non_negative();
                if !event.preemptible {
                    a.allocated_non_preemptible.sub_assign(&event.requirement);
                    a.allocated_non_preemptible.clamp_non_negative();
                }
            }
        }
    }
}

pub struct ProportionPlugin {
    k: f64,
    state: Arc<EngineState>,
}

pub fn factory(arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    let k = float_argument(arguments, "k")?.unwrap_or(DEFAULT_K);
    if k < 0.0 {
        return Err(SchedulerError::Config("k must be non-negative".to_string()));
    }
    Ok(Box::new(ProportionPlugin {
        k,
        state: Arc::new(EngineState {
            attrs: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        }),
    }))
}

impl Plugin for ProportionPlugin {
    fn name(&self) -> &str {
        "proportion"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        let attrs = compute_attributes(
            session,
            self.k,
            session.config.options.full_hierarchy_fairness,
        );
        for a in attrs.values() {
            debug!(
                "queue {}: deserved [{}], allocated [{}], request [{}]",
                a.name, a.deserved, a.allocated, a.request
            );
        }
        *self.state.attrs.write().unwrap() = attrs;
        *self.state.groups.write().unwrap() = session
            .snapshot
            .pod_groups
            .values()
            .map(|g| (g.name.clone(), (g.queue.clone(), g.preemptible)))
            .collect();

        let handler: Arc<dyn EventHandler> = self.state.clone();
        session.ext.event_handlers.push(handler);

        let state = self.state.clone();
        session.ext.queue_metrics_fns.push(Arc::new(move |queue| {
            state.attrs.read().unwrap().get(queue).map(|a| a.metrics())
        }));

        let state = self.state.clone();
        session
            .ext
            .can_reclaim_resources_fns
            .push(Arc::new(move |queue, demand| {
                let attrs = state.attrs.read().unwrap();
                let Some(a) = attrs.get(queue) else {
                    return false;
                };
                fits_within(&a.allocated, demand, &a.fair_share)
            }));

        let state = self.state.clone();
        session
            .ext
            .job_over_capacity_fns
            .push(Arc::new(move |group, demand| {
                let attrs = state.attrs.read().unwrap();
                check_queue_capacity(&attrs, &group.queue, demand, group.preemptible)
            }));

        let state = self.state.clone();
        session
            .ext
            .pre_predicate_fns
            .push(Arc::new(move |_cycle, pod, group| {
                // Parent-queue walk; preemptible jobs bypass it.
                if group.preemptible {
                    return Ok(());
                }
                let attrs = state.attrs.read().unwrap();
                let demand = pod.requirements.required_init_quota();
                let mut current = attrs.get(&group.queue).and_then(|a| a.parent.clone());
                while let Some(queue) = current {
                    check_queue_capacity(&attrs, &queue, &demand, false)?;
                    current = attrs.get(&queue).and_then(|a| a.parent.clone());
                }
                Ok(())
            }));

        let state = self.state.clone();
        session
            .ext
            .reclaimable_fns
            .push(Arc::new(move |snapshot, reclaimer, victims| {
                reclaim_admissible(&state, snapshot, reclaimer, victims)
            }));
    }
}

fn fits_within(allocated: &ResourceVector, demand: &ResourceVector, bound: &ResourceVector) -> bool {
    for (i, wanted) in demand.iter() {
        if wanted <= 0.0 {
            continue;
        }
        if allocated.get(i) + wanted > bound.get(i) + EPSILON {
            return false;
        }
    }
    true
}

fn check_queue_capacity(
    attrs: &HashMap<String, QueueAttributes>,
    queue: &str,
    demand: &ResourceVector,
    preemptible: bool,
) -> Result<(), AdmissionError> {
    let Some(a) = attrs.get(queue) else {
        return Ok(());
    };
    for (i, wanted) in demand.iter() {
        if wanted <= 0.0 {
            continue;
        }
        if let Some(limit) = a.limit_of(i)
            && a.allocated.get(i) + wanted > limit + EPSILON
        {
            return Err(AdmissionError::OverLimit {
                queue: queue.to_string(),
                resource: resources::name_of(i),
            });
        }
        if !preemptible
            && a.allocated_non_preemptible.get(i) + wanted > a.deserved.get(i) + EPSILON
        {
            return Err(AdmissionError::NonPreemptibleOverQuota {
                queue: queue.to_string(),
                resource: resources::name_of(i),
            });
        }
    }
    Ok(())
}

/// The detailed reclaim admission rule:
/// (a) every victim queue keeps at least its deserved share,
/// (b) the reclaimer plus its demand stays within its own fair share,
/// (c) after the reclaim the reclaimer's utilization ratio is strictly
///     below every sibling's on some resource bounded for both,
/// (d) a non-preemptible reclaimer respects deserved at every ancestor.
fn reclaim_admissible(
    state: &EngineState,
    snapshot: &crate::snapshot::ClusterSnapshot,
    reclaimer: &crate::info::PodGroupInfo,
    victims: &[&crate::info::PodInfo],
) -> bool {
    let attrs = state.attrs.read().unwrap();
    let groups = state.groups.read().unwrap();

    let mut demand = ResourceVector::new();
    for pod in snapshot.group_pods(&reclaimer.name) {
        if pod.status == PodStatus::Pending {
            demand.add_assign(&pod.requirements.vector);
        }
    }

    // Victim resources per queue.
    let mut losses: HashMap<String, ResourceVector> = HashMap::new();
    for victim in victims {
        let Some((queue, _)) = groups.get(&victim.pod_group) else {
            return false;
        };
        losses
            .entry(queue.clone())
            .or_default()
            .add_assign(&victim.requirements.vector);
    }

    // (a): the floor is the hard quota entitlement (capped by the limit).
    // Over-quota claims are exactly the portion reclaim may take back.
    for (queue, loss) in &losses {
        let Some(a) = attrs.get(queue) else {
            return false;
        };
        for (i, lost) in loss.iter() {
            if lost <= 0.0 {
                continue;
            }
            let floor = match a.limit_of(i) {
                Some(limit) => a.quota.get(i).min(limit),
                None => a.quota.get(i),
            };
            if a.allocated.get(i) - lost < floor - EPSILON {
                return false;
            }
        }
    }

    let Some(r) = attrs.get(&reclaimer.queue) else {
        return false;
    };

    // (b)
    if !fits_within(&r.allocated, &demand, &r.fair_share) {
        return false;
    }

    // (c): strict improvement against every sibling at the common parent.
    let reclaimed_after = r.allocated.plus(&demand);
    for sibling in attrs.values() {
        if sibling.name == r.name || sibling.parent != r.parent {
            continue;
        }
        let sibling_allocated = match losses.get(&sibling.name) {
            Some(loss) => sibling.allocated.minus(loss),
            None => sibling.allocated.clone(),
        };
        let mut comparable = false;
        let mut improved = false;
        let len = r.fair_share.len().max(sibling.fair_share.len());
        for i in 0..len {
            let r_share = r.fair_share.get(i);
            let s_share = sibling.fair_share.get(i);
            if r_share <= 0.0 || s_share <= 0.0 {
                // Unbounded for at least one side on this resource.
                continue;
            }
            comparable = true;
            if reclaimed_after.get(i) / r_share < sibling_allocated.get(i) / s_share - EPSILON {
                improved = true;
                break;
            }
        }
        if comparable && !improved {
            return false;
        }
    }

    // (d)
    if !reclaimer.preemptible {
        let chain = {
            let mut chain = vec![r.name.clone()];
            let mut current = r.parent.clone();
            while let Some(parent) = current {
                current = attrs.get(&parent).and_then(|a| a.parent.clone());
                chain.push(parent);
            }
            chain
        };
        for queue in chain {
            let Some(a) = attrs.get(&queue) else { continue };
            if !fits_within(&a.allocated_non_preemptible, &demand, &a.deserved) {
                return false;
            }
        }
    }
    true
}

/// Bottom-up aggregation plus top-down division.
fn compute_attributes(
    session: &Session,
    k: f64,
    full_hierarchy: bool,
) -> HashMap<String, QueueAttributes> {
    let snapshot = &session.snapshot;
    let mut attrs: HashMap<String, QueueAttributes> = snapshot
        .queues
        .values()
        .map(|q| {
            (
                q.name.clone(),
                QueueAttributes {
                    name: q.name.clone(),
                    parent: q.parent.clone(),
                    quota: q.quota.clone(),
                    weight: q.over_quota_weight.clone(),
                    limit: q.limit.clone(),
                    ..Default::default()
                },
            )
        })
        .collect();

    // Direct per-queue tallies.
    for group in snapshot.pod_groups.values() {
        let Some(a) = attrs.get_mut(&group.queue) else {
            continue;
        };
        for pod in snapshot.group_pods(&group.name) {
            if pod.occupies_node() {
                a.allocated.add_assign(&pod.requirements.vector);
                if !group.preemptible {
                    a.allocated_non_preemptible.add_assign(&pod.requirements.vector);
                }
                a.request.add_assign(&pod.requirements.vector);
            } else if pod.status == PodStatus::Pending {
                a.request.add_assign(&pod.requirements.vector);
            }
        }
    }

    // Bottom-up: leaves into parents, deepest first.
    let mut order: Vec<(usize, String)> = attrs
        .keys()
        .map(|name| (depth_of(&attrs, name), name.clone()))
        .collect();
    order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, name) in &order {
        let (parent, allocated, non_preemptible, request) = {
            let a = &attrs[name];
            (
                a.parent.clone(),
                a.allocated.clone(),
                a.allocated_non_preemptible.clone(),
                a.request.clone(),
            )
        };
        if let Some(parent) = parent
            && let Some(p) = attrs.get_mut(&parent)
        {
            p.allocated.add_assign(&allocated);
            p.allocated_non_preemptible.add_assign(&non_preemptible);
            p.request.add_assign(&request);
        }
    }

    // Top-down division of the cluster total.
    let usage = &snapshot.usage_window;
    if full_hierarchy {
        let roots: Vec<String> = attrs
            .values()
            .filter(|a| a.parent.is_none())
            .map(|a| a.name.clone())
            .collect();
        divide_level(&mut attrs, &roots, &snapshot.total_resource, usage, k);
        let mut frontier = roots;
        while let Some(queue) = frontier.pop() {
            let children: Vec<String> = attrs
                .values()
                .filter(|a| a.parent.as_deref() == Some(&queue))
                .map(|a| a.name.clone())
                .collect();
            if children.is_empty() {
                continue;
            }
            let available = attrs[&queue].fair_share.clone();
            divide_level(&mut attrs, &children, &available, usage, k);
            frontier.extend(children);
        }
    } else {
        let all: Vec<String> = attrs.keys().cloned().collect();
        divide_level(&mut attrs, &all, &snapshot.total_resource, usage, k);
    }
    attrs
}

fn depth_of(attrs: &HashMap<String, QueueAttributes>, name: &str) -> usize {
    let mut depth = 0;
    let mut current = attrs.get(name).and_then(|a| a.parent.clone());
    while let Some(parent) = current {
        depth += 1;
        current = attrs.get(&parent).and_then(|a| a.parent.clone());
    }
    depth
}

fn divide_level(
    attrs: &mut HashMap<String, QueueAttributes>,
    members: &[String],
    available: &ResourceVector,
    usage: &HashMap<String, std::collections::VecDeque<ResourceVector>>,
    k: f64,
) {
    let mut sorted: Vec<String> = members.to_vec();
    sorted.sort();
    let views: Vec<&QueueAttributes> = sorted.iter().map(|name| &attrs[name]).collect();
    let shares = divide_round_based(&views, available, usage, k);
    for (name, share) in sorted.iter().zip(shares) {
        let a = attrs.get_mut(name).unwrap();
        a.deserved = share.clone();
        a.fair_share = share;
    }
}
