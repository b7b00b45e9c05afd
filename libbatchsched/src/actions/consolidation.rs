//! Non-destructive defragmentation: when a pending gang fails on
//! fragmentation (enough idle capacity in total, no placement), relocate
//! up to `max_consolidation_preemptees` lower-priority allocated pods to
//! other nodes and place the gang into the freed region. Commits only if
//! the gang completes and every relocated pod found a new home.

use log::debug;

use crate::actions::{
    demand_of, find_node_in_set, pending_jobs, queues_by_fairness, sort_victims,
    tasks_to_allocate, Action,
};
use crate::cycle_state::CycleState;
use crate::events::{EventReason, SchedulingEvent};
use crate::fit_error::FitErrorHistogram;
use crate::resources::ResourceVector;
use crate::session::Session;
use crate::statement::Statement;

pub struct ConsolidationAction;

impl Action for ConsolidationAction {
    fn name(&self) -> &'static str {
        "consolidation"
    }

    fn execute(&self, session: &mut Session) {
        for queue in queues_by_fairness(session) {
            for job in pending_jobs(session, &queue, self.name()) {
                attempt_consolidate(session, &job);
            }
        }
    }
}

fn total_idle(session: &Session) -> ResourceVector {
    let mut idle = ResourceVector::new();
    for node in session.snapshot.nodes.values() {
        idle.add_assign(&node.idle);
    }
    idle
}

fn attempt_consolidate(session: &mut Session, job: &str) -> bool {
    let group = match session.snapshot.pod_groups.get(job) {
        Some(group) => group.clone(),
        None => return false,
    };
    if session.snapshot.is_gang_satisfied(job) {
        return false;
    }
    let tasks = tasks_to_allocate(session, job);
    if tasks.is_empty() {
        return false;
    }

    // Only fragmentation is worth consolidating: the cluster as a whole
    // must still have room for the gang.
    let demand = demand_of(&session.snapshot, &tasks);
    if !demand.less_equal(&total_idle(session)) {
        return false;
    }

    // Movable pods: same or lower priority, cheapest first. Crossing
    // queues is reclaim-flavored and stays behind its flag.
    let cross_queue = session.config.options.allow_consolidating_reclaim;
    let mut movable: Vec<String> = session
        .snapshot
        .pod_groups
        .values()
        .filter(|g| g.name != group.name && g.priority <= group.priority)
        .filter(|g| cross_queue || g.queue == group.queue)
        .flat_map(|g| session.snapshot.group_pods(&g.name))
        .filter(|pod| pod.is_victim_candidate())
        .map(|pod| pod.name.clone())
        .collect();
    if movable.is_empty() {
        return false;
    }
    sort_victims(&session.snapshot, &mut movable);
    movable.truncate(session.config.options.max_consolidation_preemptees);

    let Session {
        snapshot,
        ext,
        pending_commits,
        events,
        ..
    } = session;

    for count in 1..=movable.len() {
        let set = &movable[..count];
        let mut histogram = FitErrorHistogram::default();
        let mut stmt =
            Statement::new(&mut *snapshot, ext.event_handlers.clone(), &mut *pending_commits);
        let mut ok = true;

        for victim in set {
            if stmt
                .evict(victim, EventReason::Consolidated, "relocated to defragment")
                .is_err()
            {
                ok = false;
                break;
            }
        }

        // Every displaced pod moves to a different node.
        if ok {
            for victim in set {
                let pod = stmt.snapshot().pods[victim].clone();
                let origin = pod.node_name.clone().unwrap_or_default();
                let candidates: Vec<String> = stmt
                    .snapshot()
                    .node_names_sorted()
                    .into_iter()
                    .filter(|name| name != &origin)
                    .collect();
                let mut state = CycleState::default();
                match find_node_in_set(
                    ext,
                    stmt.snapshot(),
                    &pod,
                    &mut state,
                    &candidates,
                    false,
                    &mut histogram,
                ) {
                    Some(node) => {
                        if stmt.pipeline(victim, &node, true).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
        }

        // The reclaimer takes the freed region.
        if ok {
            let candidates = stmt.snapshot().node_names_sorted();
            for task in &tasks {
                let pod = stmt.snapshot().pods[task].clone();
                let mut state = CycleState::default();
                match find_node_in_set(
                    ext,
                    stmt.snapshot(),
                    &pod,
                    &mut state,
                    &candidates,
                    true,
                    &mut histogram,
                ) {
                    Some(node) => {
                        if stmt.pipeline(task, &node, true).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
        }

        if ok && stmt.snapshot().is_gang_satisfied(job) {
            stmt.commit();
            debug!("consolidation moved {count} pod(s) to place {job}");
            for victim in set {
                events.push(SchedulingEvent::for_pod(
                    victim,
                    EventReason::Consolidated,
                    format!("relocated to make room for {job}"),
                ));
            }
            return true;
        }
        // Rollback via drop; widen the victim set and retry.
    }
    false
}
