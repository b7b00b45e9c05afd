//! Captures the decision plan for debugging: the snapshot as JSON at
//! session open, logged (at debug) with the cycle outcome at close.

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;
use crate::snapshot::ClusterSnapshot;

pub struct SnapshotPlugin {
    captured: Option<String>,
}

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(SnapshotPlugin { captured: None }))
}

pub fn capture(snapshot: &ClusterSnapshot) -> serde_json::Result<String> {
    serde_json::to_string(snapshot)
}

pub fn restore(captured: &str) -> serde_json::Result<ClusterSnapshot> {
    serde_json::from_str(captured)
}

impl Plugin for SnapshotPlugin {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        match capture(&session.snapshot) {
            Ok(captured) => {
                log::debug!("captured cycle snapshot ({} bytes)", captured.len());
                self.captured = Some(captured);
            }
            Err(e) => log::warn!("snapshot capture failed: {e}"),
        }
    }

    fn on_session_close(&mut self, session: &mut Session) {
        if self.captured.is_some() {
            log::debug!(
                "cycle finished with {} commit(s), {} event(s)",
                session.pending_commits.len(),
                session.events.len()
            );
        }
    }
}
