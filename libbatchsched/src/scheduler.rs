//! Cycle orchestration: snapshot, open session (plugins register, the
//! fairness pass runs), actions in configured order, close, hand the
//! committed requests to the caller.

use log::{debug, warn};

use crate::actions::{run_actions, ActionRegistry};
use crate::cache::Cache;
use crate::commit::CommitRequest;
use crate::config::SchedulerConfig;
use crate::events::SchedulingEvent;
use crate::fit_error::SchedulerError;
use crate::plugins::PluginRegistry;
use crate::session::Session;

pub struct Scheduler {
    cache: Cache,
    config: SchedulerConfig,
    plugins: PluginRegistry,
    actions: ActionRegistry,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            cache: Cache::default(),
            config,
            plugins: PluginRegistry::builtin(),
            actions: ActionRegistry::builtin(),
        }
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// One scheduling cycle over a fresh snapshot. Session-fatal errors
    /// abort the cycle without committing anything; per-task and per-group
    /// failures come back as events, never as errors.
    pub fn run_cycle(
        &mut self,
    ) -> Result<(Vec<CommitRequest>, Vec<SchedulingEvent>), SchedulerError> {
        let snapshot = self.cache.snapshot();
        debug!(
            "cycle start: {} node(s), {} pod(s), {} group(s), {} queue(s)",
            snapshot.nodes.len(),
            snapshot.pods.len(),
            snapshot.pod_groups.len(),
            snapshot.queues.len()
        );
        let mut session = Session::open(snapshot, self.config.clone(), &self.plugins)?;
        if let Err(e) = run_actions(&mut session, &self.actions) {
            warn!("cycle aborted: {e}");
            return Err(e);
        }
        Ok(session.close())
    }

    /// Feeds committed effects back into the cache; deployments with real
    /// informers observe the same transitions through watches instead.
    pub fn reconcile(&mut self, requests: &[CommitRequest]) {
        self.cache.reconcile(requests);
    }
}
