//! Prefers groups still below their min-available: a gang that has not
//! started yet goes before one asking to grow beyond its threshold.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct ElasticPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(ElasticPlugin))
}

impl Plugin for ElasticPlugin {
    fn name(&self) -> &str {
        "elastic"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        let members: Arc<HashMap<String, u32>> = Arc::new(
            session
                .snapshot
                .pod_groups
                .keys()
                .map(|name| (name.clone(), session.snapshot.group_member_count(name)))
                .collect(),
        );
        session.ext.job_order_fns.push(Arc::new(move |a, b| {
            let a_below = members.get(&a.name).copied().unwrap_or(0) < a.min_available;
            let b_below = members.get(&b.name).copied().unwrap_or(0) < b.min_available;
            match (a_below, b_below) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::info::{PodGroupInfo, PodInfo, PodStatus};
    use crate::plugins::PluginRegistry;
    use crate::resources::{ResourceRequirements, ResourceVector};
    use crate::snapshot::ClusterSnapshot;

    #[test]
    fn test_below_min_available_first() {
        let mut snapshot = ClusterSnapshot::new();
        let mut started = PodGroupInfo::new("started", "q", 1);
        started.pod_names.insert("p1".to_string());
        let mut pod = PodInfo::new(
            "p1",
            "started",
            ResourceRequirements::new(ResourceVector::one_pod()),
        );
        pod.status = PodStatus::Running;
        pod.node_name = Some("n".to_string());
        snapshot.pods.insert("p1".to_string(), pod);
        snapshot.pod_groups.insert("started".to_string(), started);

        let waiting = PodGroupInfo::new("waiting", "q", 1);
        snapshot
            .pod_groups
            .insert("waiting".to_string(), waiting);

        let mut session = Session::open(
            snapshot,
            SchedulerConfig {
                tiers: vec![],
                ..Default::default()
            },
            &PluginRegistry::builtin(),
        )
        .unwrap();
        let mut plugin = ElasticPlugin;
        plugin.on_session_open(&mut session);

        let started = session.snapshot.pod_groups["started"].clone();
        let waiting = session.snapshot.pod_groups["waiting"].clone();
        assert_eq!(session.ext.job_order(&waiting, &started), Ordering::Less);
    }
}
