//! Required pod (anti-)affinity against the label counts of pods already
//! on each node, plus a soft score for co-location.

use std::sync::Arc;

use crate::fit_error::{FitError, FitReason, SchedulerError};
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct PodAffinityPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(PodAffinityPlugin))
}

const PRE_ORDER_KEY: &str = "PreOrderPodAffinity";

struct PreOrderState {
    has_terms: bool,
}

impl Plugin for PodAffinityPlugin {
    fn name(&self) -> &str {
        "podaffinity"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session
            .ext
            .node_pre_order_fns
            .push(Arc::new(|state, pod, _nodes| {
                state.write(
                    PRE_ORDER_KEY,
                    Box::new(PreOrderState {
                        has_terms: pod.affinity.is_some(),
                    }),
                );
            }));

        session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
            let Some(affinity) = &pod.affinity else {
                return Ok(());
            };
            for term in &affinity.required {
                if node.pods_with_label(&term.key, &term.value) == 0 {
                    return Err(FitError::single(&node.name, FitReason::AffinityMismatch));
                }
            }
            for term in &affinity.anti_required {
                if node.pods_with_label(&term.key, &term.value) > 0 {
                    return Err(FitError::single(&node.name, FitReason::AffinityMismatch));
                }
            }
            Ok(())
        }));

        session.ext.node_order_fns.push(Arc::new(|state, pod, node| {
            if let Some(pre) = state.read::<PreOrderState>(PRE_ORDER_KEY)
                && !pre.has_terms
            {
                return 0.0;
            }
            let Some(affinity) = &pod.affinity else {
                return 0.0;
            };
            affinity
                .required
                .iter()
                .map(|term| node.pods_with_label(&term.key, &term.value) as f64)
                .sum()
        }));
    }
}
