//! Steers shared-GPU pods toward nodes where an already-partially-used
//! device can absorb the request, packing memory instead of opening fresh
//! devices.

use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::resources::GPU;
use crate::session::Session;

const PACKED_GROUP_WEIGHT: f64 = 50.0;
const FRESH_DEVICE_SCORE: f64 = 10.0;

pub struct GpuSharingOrderPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(GpuSharingOrderPlugin))
}

impl Plugin for GpuSharingOrderPlugin {
    fn name(&self) -> &str {
        "gpusharingorder"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.node_order_fns.push(Arc::new(|_state, pod, node| {
            if !pod.requirements.gpu.is_shared() || node.gpu_memory == 0 {
                return 0.0;
            }
            let memory = pod.requirements.gpu.shared_memory(node.gpu_memory);
            let best_fitting = node
                .gpu_sharing
                .allocated
                .values()
                .filter(|&&allocated| allocated + memory <= node.gpu_memory)
                .max();
            match best_fitting {
                // The fuller the surviving group, the better the packing.
                Some(&allocated) => {
                    PACKED_GROUP_WEIGHT * (1.0 + allocated as f64 / node.gpu_memory as f64)
                }
                None if node.idle.get(GPU) >= 1.0 => FRESH_DEVICE_SCORE,
                None => 0.0,
            }
        }));
    }
}
