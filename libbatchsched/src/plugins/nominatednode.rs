//! Honors a previously nominated node with a score bonus large enough to
//! dominate the soft placement scores.

use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

const NOMINATION_BONUS: f64 = 1000.0;

pub struct NominatedNodePlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(NominatedNodePlugin))
}

impl Plugin for NominatedNodePlugin {
    fn name(&self) -> &str {
        "nominatednode"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.node_order_fns.push(Arc::new(|_state, pod, node| {
            if pod.nominated_node.as_deref() == Some(node.name.as_str()) {
                NOMINATION_BONUS
            } else {
                0.0
            }
        }));
    }
}
