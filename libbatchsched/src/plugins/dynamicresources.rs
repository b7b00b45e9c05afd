//! Resolves DRA resource claims against per-node device-class capacity. A
//! claim whose device class does not exist on the node at all is
//! unresolvable there, as opposed to temporarily exhausted; both surface
//! as typed fit errors. Device counts themselves are adjusted by the node
//! accounting inside statement operations, so rollback restores them.

use std::sync::Arc;

use crate::fit_error::{FitError, FitReason, SchedulerError};
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct DynamicResourcesPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(DynamicResourcesPlugin))
}

impl Plugin for DynamicResourcesPlugin {
    fn name(&self) -> &str {
        "dynamicresources"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
            for claim in &pod.dra_claims {
                if !node.dra_free.contains_key(&claim.device_class) {
                    return Err(FitError::single(
                        &node.name,
                        FitReason::DraDeviceUnavailable {
                            device_class: claim.device_class.clone(),
                        },
                    ));
                }
            }
            Ok(())
        }));
    }
}
