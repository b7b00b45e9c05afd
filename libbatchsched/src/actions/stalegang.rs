//! Evicts gangs that have held a partial allocation longer than the
//! staleness grace period, freeing their fragments for groups that can
//! actually start.

use chrono::{Duration, Utc};
use log::info;

use crate::actions::Action;
use crate::events::{EventReason, SchedulingEvent};
use crate::session::Session;
use crate::statement::Statement;

pub struct StaleGangAction;

impl Action for StaleGangAction {
    fn name(&self) -> &'static str {
        "stalegang"
    }

    fn execute(&self, session: &mut Session) {
        let grace_seconds = session.config.options.default_staleness_grace_period;
        if grace_seconds < 0 {
            // -1 disables staleness eviction entirely.
            return;
        }
        let deadline = Utc::now() - Duration::seconds(grace_seconds);

        let stale: Vec<String> = session
            .snapshot
            .pod_groups
            .values()
            .filter(|group| {
                group
                    .partial_since
                    .map(|since| since < deadline)
                    .unwrap_or(false)
            })
            .filter(|group| session.snapshot.is_partially_allocated(&group.name))
            .map(|group| group.name.clone())
            .collect();

        for job in stale {
            let members: Vec<String> = session
                .snapshot
                .group_pods(&job)
                .into_iter()
                .filter(|pod| pod.is_victim_candidate())
                .map(|pod| pod.name.clone())
                .collect();

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
                    .evict(pod, EventReason::GangEvicted, "stale partial gang")
                    .is_err()
                {
                    ok = false;
                    break;
                }
            }
            if ok {
                stmt.commit();
                info!("evicted stale gang {job} ({} pod(s))", members.len());
                events.push(SchedulingEvent::for_group(
                    &job,
                    EventReason::GangEvicted,
                    format!("partial allocation older than {grace_seconds}s"),
                ));
            }
        }
    }
}
