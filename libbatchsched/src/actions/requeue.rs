//! Evicts groups nominated for requeue (expected runtime exceeded) and
//! stamps the next cooldown gate.

use chrono::{Duration, Utc};
use log::info;

use common::annotations;

use crate::actions::Action;
use crate::commit::CommitRequest;
use crate::events::{EventReason, SchedulingEvent};
use crate::session::Session;
use crate::statement::Statement;

pub struct RequeueAction;

impl Action for RequeueAction {
    fn name(&self) -> &'static str {
        "requeue"
    }

    fn execute(&self, session: &mut Session) {
        let now = Utc::now();
        let candidates = session.ext.requeue_candidates(&session.snapshot, now);
        let cooldown = Duration::seconds(session.ext.requeue_cooldown_seconds);
        let not_before = (now + cooldown).to_rfc3339();

        for job in candidates {
            let members: Vec<String> = session
                .snapshot
                .group_pods(&job)
                .into_iter()
                .filter(|pod| pod.is_victim_candidate())
                .map(|pod| pod.name.clone())
                .collect();
            if members.is_empty() {
                continue;
            }

            let Session {
                snapshot,
                ext,
                pending_commits,
                events,
                ..
            } = &mut *session;
            let mut stmt =
                Statement::new(&mut *snapshot, ext.event_handlers.clone(), &mut *pending_commits);
            let mut ok = true;
            for pod in &members {
                if stmt
                    .evict(pod, EventReason::Requeued, "expected runtime exceeded")
                    .is_err()
                {
                    ok = false;
                    break;
                }
            }
            if !ok {
                continue;
            }
            stmt.commit();
            info!("requeued {job}; next attempt gated until {not_before}");

            if let Some(group) = snapshot.pod_groups.get_mut(&job) {
                group.annotations.insert(
                    annotations::REQUEUE_NOT_BEFORE.to_string(),
                    not_before.clone(),
                );
            }
            pending_commits.push(CommitRequest::GroupAnnotation {
                group: job.clone(),
                key: annotations::REQUEUE_NOT_BEFORE.to_string(),
                value: not_before.clone(),
            });
            events.push(SchedulingEvent::for_group(
                &job,
                EventReason::Requeued,
                "expected runtime exceeded".to_string(),
            ));
        }
    }
}
