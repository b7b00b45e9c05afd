//! Nominates preemptible running groups that have exceeded their expected
//! runtime, gated by a cooldown annotation.
//!
//! Contract: the boundary is inclusive. A group whose runtime equals its
//! expected runtime exactly IS nominated. Clock skew (now before the last
//! start) and missing or unparseable annotations skip the group.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::fit_error::SchedulerError;
use crate::info::PodGroupInfo;
use crate::plugins::{float_argument, Plugin, PluginArguments};
use crate::session::Session;
use crate::snapshot::ClusterSnapshot;

pub const DEFAULT_COOLDOWN_SECONDS: i64 = 300;

pub struct RequeuePlugin {
    pub cooldown_seconds: i64,
}

pub fn factory(arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(RequeuePlugin {
        cooldown_seconds: float_argument(arguments, "cooldownSeconds")?
            .unwrap_or(DEFAULT_COOLDOWN_SECONDS as f64) as i64,
    }))
}

pub fn is_runtime_exceeded(group: &PodGroupInfo, now: DateTime<Utc>) -> bool {
    let Some(last_start) = group.last_start_timestamp else {
        return false;
    };
    if now < last_start {
        // Clock skew; never treat this as negative runtime.
        return false;
    }
    let Some(expected) = group.expected_runtime() else {
        return false;
    };
    now - last_start >= expected
}

fn gate_passed(group: &PodGroupInfo, now: DateTime<Utc>) -> bool {
    match group.requeue_not_before() {
        Some(not_before) => now >= not_before,
        None => true,
    }
}

pub fn nominate(snapshot: &ClusterSnapshot, now: DateTime<Utc>) -> Vec<String> {
    let mut nominated: Vec<String> = snapshot
        .pod_groups
        .values()
        .filter(|group| group.preemptible)
        .filter(|group| snapshot.is_gang_satisfied(&group.name))
        .filter(|group| is_runtime_exceeded(group, now))
        .filter(|group| gate_passed(group, now))
        .map(|group| group.name.clone())
        .collect();
    nominated.sort();
    nominated
}

impl Plugin for RequeuePlugin {
    fn name(&self) -> &str {
        "requeue"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.requeue_cooldown_seconds = self.cooldown_seconds;
        session
            .ext
            .requeue_candidate_fns
            .push(Arc::new(|snapshot, now| nominate(snapshot, now)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{PodInfo, PodStatus};
    use crate::resources::{ResourceRequirements, ResourceVector};
    use chrono::Duration;
    use common::annotations;

    fn running_group(name: &str, started_hours_ago: i64, expected: &str) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::new();
        let mut group = PodGroupInfo::new(name, "q", 1);
        group.preemptible = true;
        group.last_start_timestamp = Some(Utc::now() - Duration::hours(started_hours_ago));
        if !expected.is_empty() {
            group.annotations.insert(
                annotations::EXPECTED_RUNTIME.to_string(),
                expected.to_string(),
            );
        }
        let mut pod = PodInfo::new(
            "p0",
            name,
            ResourceRequirements::new(ResourceVector::one_pod()),
        );
        pod.status = PodStatus::Running;
        pod.node_name = Some("n".to_string());
        group.pod_names.insert("p0".to_string());
        snapshot.pods.insert("p0".to_string(), pod);
        snapshot.pod_groups.insert(name.to_string(), group);
        snapshot
    }

    #[test]
    fn test_exceeded_runtime_nominates() {
        let snapshot = running_group("g", 2, "1h");
        assert_eq!(nominate(&snapshot, Utc::now()), vec!["g".to_string()]);
    }

    #[test]
    fn test_boundary_equality_nominates() {
        let mut snapshot = running_group("g", 0, "1h");
        let start = Utc::now();
        snapshot
            .pod_groups
            .get_mut("g")
            .unwrap()
            .last_start_timestamp = Some(start);
        assert_eq!(
            nominate(&snapshot, start + Duration::hours(1)),
            vec!["g".to_string()]
        );
    }

    #[test]
    fn test_missing_annotation_skips() {
        let snapshot = running_group("g", 2, "");
        assert!(nominate(&snapshot, Utc::now()).is_empty());
    }

    #[test]
    fn test_unparseable_annotation_skips() {
        let snapshot = running_group("g", 2, "a-while");
        assert!(nominate(&snapshot, Utc::now()).is_empty());
    }

    #[test]
    fn test_clock_skew_skips() {
        let snapshot = running_group("g", 2, "1h");
        let before_start = Utc::now() - Duration::hours(3);
        assert!(nominate(&snapshot, before_start).is_empty());
    }

    #[test]
    fn test_cooldown_gate_blocks() {
        let mut snapshot = running_group("g", 2, "1h");
        snapshot.pod_groups.get_mut("g").unwrap().annotations.insert(
            annotations::REQUEUE_NOT_BEFORE.to_string(),
            (Utc::now() + Duration::hours(1)).to_rfc3339(),
        );
        assert!(nominate(&snapshot, Utc::now()).is_empty());
    }

    #[test]
    fn test_non_preemptible_never_nominated() {
        let mut snapshot = running_group("g", 2, "1h");
        snapshot.pod_groups.get_mut("g").unwrap().preemptible = false;
        assert!(nominate(&snapshot, Utc::now()).is_empty());
    }
}
