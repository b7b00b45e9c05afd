//! Binpack on whole GPUs: the fuller a node's devices, the higher its
//! score, so free devices concentrate on as few nodes as possible.

use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::info::NodeInfo;
use crate::plugins::{Plugin, PluginArguments};
use crate::resources::GPU;
use crate::session::Session;

pub const MAX_SCORE: f64 = 100.0;

pub fn score(node: &NodeInfo) -> f64 {
    let allocatable = node.allocatable.get(GPU);
    if allocatable <= 0.0 {
        return 0.0;
    }
    MAX_SCORE * node.used.get(GPU) / allocatable
}

pub struct GpuPackPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(GpuPackPlugin))
}

impl Plugin for GpuPackPlugin {
    fn name(&self) -> &str {
        "gpupack"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session
            .ext
            .node_order_fns
            .push(Arc::new(|_state, _pod, node| score(node)));
    }
}
