//! Orders jobs by priority, then by creation time.

use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct PriorityPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(PriorityPlugin))
}

impl Plugin for PriorityPlugin {
    fn name(&self) -> &str {
        "priority"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.job_order_fns.push(Arc::new(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.creation_timestamp.cmp(&b.creation_timestamp))
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::PodGroupInfo;

    #[test]
    fn test_priority_then_creation() {
        let mut plugin = PriorityPlugin;
        let mut session = crate::session::Session::open(
            crate::snapshot::ClusterSnapshot::new(),
            crate::config::SchedulerConfig {
                tiers: vec![],
                ..Default::default()
            },
            &crate::plugins::PluginRegistry::builtin(),
        )
        .unwrap();
        plugin.on_session_open(&mut session);

        let mut high = PodGroupInfo::new("b-high", "q", 1);
        high.priority = 100;
        let low = PodGroupInfo::new("a-low", "q", 1);
        assert_eq!(
            session.ext.job_order(&high, &low),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            session.ext.job_order(&low, &high),
            std::cmp::Ordering::Greater
        );
    }
}

