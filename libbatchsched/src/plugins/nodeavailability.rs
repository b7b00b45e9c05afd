//! Filters out cordoned/unschedulable nodes.

use std::sync::Arc;

use crate::fit_error::{FitError, FitReason, SchedulerError};
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct NodeAvailabilityPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(NodeAvailabilityPlugin))
}

impl Plugin for NodeAvailabilityPlugin {
    fn name(&self) -> &str {
        "nodeavailability"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.predicate_fns.push(Arc::new(|_state, _pod, node| {
            if node.unschedulable {
                Err(FitError::single(&node.name, FitReason::NodeUnschedulable))
            } else {
                Ok(())
            }
        }));
    }
}
