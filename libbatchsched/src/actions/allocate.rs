//! Places pending gangs: queues by fairness deficit, jobs by job order,
//! tasks by task order over (possibly topology-refined) candidate node
//! sets. A group commits only once it crosses gang satisfaction; anything
//! short rolls back whole.

use log::debug;

use crate::actions::{
    demand_of, find_node_in_set, pending_jobs, queues_by_fairness, tasks_to_allocate, Action,
};
use crate::commit::CommitRequest;
use crate::cycle_state::CycleState;
use crate::events::{EventReason, SchedulingEvent};
use crate::fit_error::{FitErrorHistogram, SchedulingRejection};
use crate::session::Session;
use crate::statement::Statement;

pub struct AllocateAction;

impl Action for AllocateAction {
    fn name(&self) -> &'static str {
        "allocate"
    }

    fn execute(&self, session: &mut Session) {
        for queue in queues_by_fairness(session) {
            for job in pending_jobs(session, &queue, self.name()) {
                attempt_allocate(session, &job);
            }
        }
    }
}

fn attempt_allocate(session: &mut Session, job: &str) -> bool {
    let group = match session.snapshot.pod_groups.get(job) {
        Some(group) => group.clone(),
        None => return false,
    };
    let tasks = tasks_to_allocate(session, job);
    if tasks.is_empty() {
        return false;
    }

    // Queue capacity guard over the whole gang.
    let demand = demand_of(&session.snapshot, &tasks);
    if let Err(admission) = session.ext.job_over_capacity(&group, &demand) {
        let reason = match &admission {
            crate::fit_error::AdmissionError::OverLimit { .. } => EventReason::QueueLimit,
            _ => EventReason::OverQuota,
        };
        session.pending_commits.push(CommitRequest::GroupCondition {
            group: job.to_string(),
            reason: reason.as_str().to_string(),
            message: admission.to_string(),
        });
        session.record_event(SchedulingEvent::for_group(job, reason, admission.to_string()));
        return false;
    }

    let all_nodes = session.snapshot.node_names_sorted();
    let sets = match session.ext.subset_nodes(&session.snapshot, &group, &all_nodes) {
        Ok(Some(sets)) => sets,
        Ok(None) => vec![all_nodes],
        Err(topology_error) => {
            session.pending_commits.push(CommitRequest::GroupCondition {
                group: job.to_string(),
                reason: EventReason::NotSchedulable.as_str().to_string(),
                message: topology_error.to_string(),
            });
            session.record_event(SchedulingEvent::for_group(
                job,
                EventReason::NotSchedulable,
                topology_error.to_string(),
            ));
            return false;
        }
    };

    let mut histogram = FitErrorHistogram::default();
    let Session {
        snapshot,
        ext,
        pending_commits,
        events,
        ..
    } = session;

    // A topology-constrained gang must land inside a single candidate set.
    for set in &sets {
        let mut stmt =
            Statement::new(&mut *snapshot, ext.event_handlers.clone(), &mut *pending_commits);
        let mut placed_all = true;
        for task in &tasks {
            let pod = match stmt.snapshot().pods.get(task) {
                Some(pod) => pod.clone(),
                None => {
                    placed_all = false;
                    break;
                }
            };
            let mut state = CycleState::default();
            if let Err(rejection) = ext.run_pre_predicates(&mut state, &pod, &group) {
                record_rejection(&mut histogram, events, job, &rejection);
                placed_all = false;
                break;
            }
            // Per-task capacity with the init quota, against the tentative
            // queue accounting.
            if ext
                .job_over_capacity(&group, &pod.requirements.required_init_quota())
                .is_err()
            {
                placed_all = false;
                break;
            }
            let node = find_node_in_set(
                ext,
                stmt.snapshot(),
                &pod,
                &mut state,
                set,
                false,
                &mut histogram,
            );
            match node {
                Some(node) => {
                    if stmt.allocate(task, &node).is_err() {
                        placed_all = false;
                        break;
                    }
                }
                None => {
                    placed_all = false;
                    break;
                }
            }
        }

        if placed_all && stmt.snapshot().is_gang_satisfied(job) {
            let committed = stmt.commit();
            debug!("allocated {committed} task(s) of {job}");
            return true;
        }
        // Statement drop rolls the whole group back before the next set.
    }

    if !histogram.is_empty() {
        if let Some(group) = snapshot.pod_groups.get_mut(job) {
            group.fit_errors.merge(&histogram);
        }
        pending_commits.push(CommitRequest::GroupCondition {
            group: job.to_string(),
            reason: EventReason::NotSchedulable.as_str().to_string(),
            message: histogram.to_string(),
        });
        events.push(SchedulingEvent::for_group(
            job,
            EventReason::NotSchedulable,
            histogram.to_string(),
        ));
    }
    false
}

fn record_rejection(
    histogram: &mut FitErrorHistogram,
    events: &mut Vec<SchedulingEvent>,
    job: &str,
    rejection: &SchedulingRejection,
) {
    match rejection {
        SchedulingRejection::Fit(fit) => histogram.add(fit),
        other => events.push(SchedulingEvent::for_group(
            job,
            EventReason::NotSchedulable,
            other.to_string(),
        )),
    }
}
