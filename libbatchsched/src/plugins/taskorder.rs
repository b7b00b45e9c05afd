//! Stable task order within a sub-group, by pod name.

use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct TaskOrderPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(TaskOrderPlugin))
}

impl Plugin for TaskOrderPlugin {
    fn name(&self) -> &str {
        "taskorder"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session
            .ext
            .task_order_fns
            .push(Arc::new(|a, b| a.name.cmp(&b.name)));
    }
}
