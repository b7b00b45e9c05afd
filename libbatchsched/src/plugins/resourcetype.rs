//! Keeps device-plugin GPU pods off DRA-only nodes, and optionally keeps
//! non-GPU pods off GPU nodes entirely.

use std::sync::Arc;

use crate::fit_error::{FitError, FitReason, SchedulerError};
use crate::plugins::{bool_argument, Plugin, PluginArguments};
use crate::resources::GPU;
use crate::session::Session;

pub struct ResourceTypePlugin {
    restrict_node_scheduling: bool,
}

pub fn factory(arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(ResourceTypePlugin {
        restrict_node_scheduling: bool_argument(arguments, "restrictNodeScheduling")?
            .unwrap_or(false),
    }))
}

impl Plugin for ResourceTypePlugin {
    fn name(&self) -> &str {
        "resourcetype"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
            let wants_device_plugin_gpu =
                pod.requirements.vector.get(GPU) > 0.0 || pod.requirements.gpu.is_shared();
            if wants_device_plugin_gpu && node.dra_only {
                return Err(FitError::single(
                    &node.name,
                    FitReason::ResourceTypeMismatch {
                        detail: "device-plugin gpu request on a DRA-only node".to_string(),
                    },
                ));
            }
            Ok(())
        }));

        if self.restrict_node_scheduling {
            session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
                let wants_gpu =
                    pod.requirements.vector.get(GPU) > 0.0 || pod.requirements.gpu.is_shared();
                let gpu_node = node.allocatable.get(GPU) > 0.0;
                if gpu_node && !wants_gpu {
                    return Err(FitError::single(
                        &node.name,
                        FitReason::ResourceTypeMismatch {
                            detail: "non-gpu pod on a gpu-only node".to_string(),
                        },
                    ));
                }
                Ok(())
            }));
        }
    }
}
