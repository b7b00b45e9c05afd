//! Cross-queue reclaim: queues below their fair share take back capacity
//! from preemptible allocations in queues above theirs. Admission runs the
//! queue-level check first, then the detailed rules (deserved floors,
//! strict sibling improvement, min runtime) before anything is evicted.

use log::debug;

use crate::actions::{
    cover_demand, demand_of, find_node_in_set, pending_jobs, queues_by_fairness, sort_victims,
    tasks_to_allocate, Action,
};
use crate::cycle_state::CycleState;
use crate::events::{EventReason, SchedulingEvent};
use crate::fit_error::FitErrorHistogram;
use crate::info::PodInfo;
use crate::session::Session;
use crate::statement::Statement;

pub struct ReclaimAction;

impl Action for ReclaimAction {
    fn name(&self) -> &'static str {
        "reclaim"
    }

    fn execute(&self, session: &mut Session) {
        for queue in queues_by_fairness(session) {
            for job in pending_jobs(session, &queue, self.name()) {
                attempt_reclaim(session, &queue, &job);
            }
        }
    }
}

/// Victim queues in descending distance above fair share.
fn victim_queues(session: &Session, reclaimer_queue: &str) -> Vec<String> {
    let mut queues: Vec<(f64, String)> = session
        .snapshot
        .queues
        .keys()
        .filter(|name| name.as_str() != reclaimer_queue)
        .filter_map(|name| {
            let metrics = session.ext.queue_metrics(name)?;
            let mut distance = 0.0;
            for (i, allocated) in metrics.allocated.iter() {
                let share = metrics.fair_share.get(i);
                if allocated > share {
                    distance += allocated - share;
                }
            }
            (distance > 0.0).then(|| (distance, name.clone()))
        })
        .collect();
    queues.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    queues.into_iter().map(|(_, name)| name).collect()
}

fn attempt_reclaim(session: &mut Session, queue: &str, job: &str) -> bool {
    let group = match session.snapshot.pod_groups.get(job) {
        Some(group) => group.clone(),
        None => return false,
    };
    let tasks = tasks_to_allocate(session, job);
    if tasks.is_empty() {
        return false;
    }
    let demand = demand_of(&session.snapshot, &tasks);

    // Queue-level fairness admission.
    if !session.ext.can_reclaim_resources(queue, &demand) {
        debug!("queue {queue} may not reclaim for {job}");
        return false;
    }

    // Collect preemptible victims across over-share queues.
    let mut victims: Vec<String> = Vec::new();
    for victim_queue in victim_queues(session, queue) {
        let subtree = session.snapshot.queue_subtree(&victim_queue);
        let mut pool: Vec<String> = session
            .snapshot
            .pod_groups
            .values()
            .filter(|g| subtree.contains(&g.queue) && g.preemptible && g.name != group.name)
            .flat_map(|g| session.snapshot.group_pods(&g.name))
            .filter(|pod| pod.is_victim_candidate())
            .map(|pod| pod.name.clone())
            .collect();
        sort_victims(&session.snapshot, &mut pool);
        victims.extend(pool);
    }
    let Some(count) = cover_demand(&session.snapshot, &victims, &demand) else {
        return false;
    };
    victims.truncate(count);

    let victim_refs: Vec<&PodInfo> = victims
        .iter()
        .map(|name| &session.snapshot.pods[name])
        .collect();
    if !session.ext.reclaimable(&session.snapshot, &group, &victim_refs) {
        debug!("reclaim of {} victim(s) for {job} not admissible", victims.len());
        return false;
    }

    let mut histogram = FitErrorHistogram::default();
    let Session {
        snapshot,
        ext,
        pending_commits,
        events,
        ..
    } = session;

    let mut stmt =
        Statement::new(&mut *snapshot, ext.event_handlers.clone(), &mut *pending_commits);
    let mut ok = true;
    for victim in &victims {
        if stmt
            .evict(
                victim,
                EventReason::ReclaimedBy(job.to_string()),
                &format!("reclaimed to satisfy {job}"),
            )
            .is_err()
        {
            ok = false;
            break;
        }
    }
    if ok {
        let candidates = stmt.snapshot().node_names_sorted();
        for task in &tasks {
            let pod = stmt.snapshot().pods[task].clone();
            let mut state = CycleState::default();
            let node = find_node_in_set(
                ext,
                stmt.snapshot(),
                &pod,
                &mut state,
                &candidates,
                true,
                &mut histogram,
            );
            match node {
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
        let committed = stmt.commit();
        debug!("reclaim committed {committed} op(s) for {job}");
        for victim in &victims {
            events.push(SchedulingEvent::for_pod(
                victim,
                EventReason::ReclaimedBy(job.to_string()),
                format!("reclaimed by {job} in queue {queue}"),
            ));
        }
        true
    } else {
        false
    }
}
