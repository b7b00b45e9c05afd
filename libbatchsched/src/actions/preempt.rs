//! In-queue preemption: a higher-priority pending gang takes resources
//! from lower-priority pods of the same queue. Admission is local (no
//! cross-queue fairness) but victims still have to satisfy their minimum
//! runtime.

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

pub struct PreemptAction;

impl Action for PreemptAction {
    fn name(&self) -> &'static str {
        "preempt"
    }

    fn execute(&self, session: &mut Session) {
        for queue in queues_by_fairness(session) {
            for job in pending_jobs(session, &queue, self.name()) {
                attempt_preempt(session, &queue, &job);
            }
        }
    }
}

fn attempt_preempt(session: &mut Session, queue: &str, job: &str) -> bool {
    let group = match session.snapshot.pod_groups.get(job) {
        Some(group) => group.clone(),
        None => return false,
    };
    let tasks = tasks_to_allocate(session, job);
    if tasks.is_empty() {
        return false;
    }
    let demand = demand_of(&session.snapshot, &tasks);

    // Victims: strictly lower-priority pods of the same queue.
    let mut victims: Vec<String> = session
        .snapshot
        .pod_groups
        .values()
        .filter(|g| g.queue == queue && g.name != group.name && g.priority < group.priority)
        .flat_map(|g| session.snapshot.group_pods(&g.name))
        .filter(|pod| pod.is_victim_candidate())
        .map(|pod| pod.name.clone())
        .collect();
    if victims.is_empty() {
        return false;
    }
    sort_victims(&session.snapshot, &mut victims);
    let Some(count) = cover_demand(&session.snapshot, &victims, &demand) else {
        return false;
    };
    victims.truncate(count);

    let victim_refs: Vec<&PodInfo> = victims
        .iter()
        .map(|name| &session.snapshot.pods[name])
        .collect();
    if !session.ext.preemptable(&session.snapshot, &group, &victim_refs) {
        debug!("preemption for {job} blocked by victim eligibility");
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
                EventReason::PreemptedBy(job.to_string()),
                &format!("preempted by higher-priority {job}"),
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
        for victim in &victims {
            events.push(SchedulingEvent::for_pod(
                victim,
                EventReason::PreemptedBy(job.to_string()),
                format!("preempted in queue {queue}"),
            ));
        }
        true
    } else {
        false
    }
}
