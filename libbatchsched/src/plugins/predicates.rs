//! The per-node predicate stack: resource fit, node selector,
//! taint/toleration and volume limits. Every failure is a typed fit error
//! so the actions can build histograms instead of strings.

use std::sync::Arc;

use crate::fit_error::{FitError, FitReason, SchedulerError};
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

use common::node::{Taint, TaintEffect, Toleration};

pub struct PredicatesPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(PredicatesPlugin))
}

impl Plugin for PredicatesPlugin {
    fn name(&self) -> &str {
        "predicates"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        let detailed = session.config.options.detailed_fit_errors;

        // Resource fit against the required init quota, including shared
        // GPU and DRA capacity.
        session.ext.predicate_fns.push(Arc::new(move |_state, pod, node| {
            let mut reasons = node.fit_errors(pod, false);
            if reasons.is_empty() {
                return Ok(());
            }
            if !detailed {
                reasons.truncate(1);
            }
            Err(FitError::new(&node.name, reasons))
        }));

        session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
            for (key, wanted) in &pod.node_selector {
                if node.labels.get(key) != Some(wanted) {
                    return Err(FitError::single(
                        &node.name,
                        FitReason::NodeSelectorMismatch { key: key.clone() },
                    ));
                }
            }
            Ok(())
        }));

        session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
            match find_untolerated_taint(&node.taints, &pod.tolerations) {
                Some(taint) => Err(FitError::single(
                    &node.name,
                    FitReason::UntoleratedTaint {
                        key: taint.key.clone(),
                        value: taint.value.clone(),
                    },
                )),
                None => Ok(()),
            }
        }));

        session.ext.predicate_fns.push(Arc::new(|_state, pod, node| {
            if let Some(limit) = node.max_volume_claims
                && pod.all_claims.len() > limit
            {
                return Err(FitError::single(
                    &node.name,
                    FitReason::VolumeLimitExceeded { limit },
                ));
            }
            Ok(())
        }));
    }
}

fn find_untolerated_taint<'a>(
    taints: &'a [Taint],
    tolerations: &[Toleration],
) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|taint| {
            matches!(taint.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
        })
        .find(|taint| !tolerations.iter().any(|toleration| toleration.tolerates(taint)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::cycle_state::CycleState;
    use crate::info::{NodeInfo, PodInfo};
    use crate::plugins::PluginRegistry;
    use crate::resources::{ResourceRequirements, ResourceVector, CPU, PODS};
    use crate::snapshot::ClusterSnapshot;
    use serial_test::serial;

    fn session_with_predicates() -> Session {
        let mut session = Session::open(
            ClusterSnapshot::new(),
            SchedulerConfig {
                tiers: vec![],
                ..Default::default()
            },
            &PluginRegistry::builtin(),
        )
        .unwrap();
        PredicatesPlugin.on_session_open(&mut session);
        session
    }

    fn cpu_pod(name: &str, cpu: f64) -> PodInfo {
        let mut v = ResourceVector::one_pod();
        v.set(CPU, cpu);
        PodInfo::new(name, "g", ResourceRequirements::new(v))
    }

    fn cpu_node(name: &str, cpu: f64) -> NodeInfo {
        let mut allocatable = ResourceVector::new();
        allocatable.set(CPU, cpu);
        allocatable.set(PODS, 110.0);
        NodeInfo::new(name, allocatable)
    }

    #[test]
    #[serial]
    fn test_resource_fit_short_circuits() {
        let session = session_with_predicates();
        let state = CycleState::default();
        let pod = cpu_pod("p", 4000.0);

        let fits = cpu_node("big", 8000.0);
        assert!(session.ext.run_predicates(&state, &pod, &fits).is_ok());

        let small = cpu_node("small", 2000.0);
        let err = session.ext.run_predicates(&state, &pod, &small).unwrap_err();
        assert_eq!(err.node, "small");
        assert!(matches!(
            err.reasons[0],
            FitReason::InsufficientResource { .. }
        ));
    }

    #[test]
    #[serial]
    fn test_node_selector_mismatch() {
        let session = session_with_predicates();
        let state = CycleState::default();
        let mut pod = cpu_pod("p", 100.0);
        pod.node_selector
            .insert("pool".to_string(), "gpu".to_string());
        let mut node = cpu_node("n", 8000.0);
        let err = session.ext.run_predicates(&state, &pod, &node).unwrap_err();
        assert!(matches!(
            err.reasons[0],
            FitReason::NodeSelectorMismatch { .. }
        ));

        node.labels.insert("pool".to_string(), "gpu".to_string());
        assert!(session.ext.run_predicates(&state, &pod, &node).is_ok());
    }

    #[test]
    #[serial]
    fn test_untolerated_taint() {
        let session = session_with_predicates();
        let state = CycleState::default();
        let mut pod = cpu_pod("p", 100.0);
        let mut node = cpu_node("n", 8000.0);
        node.taints.push(Taint {
            key: "dedicated".to_string(),
            value: "batch".to_string(),
            effect: TaintEffect::NoSchedule,
        });
        assert!(session.ext.run_predicates(&state, &pod, &node).is_err());

        pod.tolerations.push(Toleration {
            key: Some("dedicated".to_string()),
            value: None,
            effect: Some(TaintEffect::NoSchedule),
        });
        assert!(session.ext.run_predicates(&state, &pod, &node).is_ok());
    }
}
