//! Victim eligibility for preempt and reclaim: a pod may only be taken
//! after it has run for the minimum runtime bound of its priority class.
//! Pods whose start time is unknown cannot be held back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::fit_error::SchedulerError;
use crate::info::PodInfo;
use crate::plugins::{float_argument, Plugin, PluginArguments};
use crate::session::Session;
use crate::snapshot::ClusterSnapshot;

pub struct MinRuntimePlugin {
    preempt_min_seconds: i64,
    reclaim_min_seconds: i64,
    per_class_seconds: BTreeMap<String, i64>,
}

pub fn factory(arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    let mut per_class_seconds = BTreeMap::new();
    if let Some(value) = arguments.get("perClassMinRuntimeSeconds") {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| {
                SchedulerError::Config("perClassMinRuntimeSeconds must be a mapping".to_string())
            })?;
        for (class, seconds) in mapping {
            let class = class.as_str().ok_or_else(|| {
                SchedulerError::Config("priority class names must be strings".to_string())
            })?;
            let seconds = seconds.as_i64().ok_or_else(|| {
                SchedulerError::Config(format!("min runtime for {class} must be seconds"))
            })?;
            per_class_seconds.insert(class.to_string(), seconds);
        }
    }
    Ok(Box::new(MinRuntimePlugin {
        preempt_min_seconds: float_argument(arguments, "preemptMinRuntimeSeconds")?
            .unwrap_or(0.0) as i64,
        reclaim_min_seconds: float_argument(arguments, "reclaimMinRuntimeSeconds")?
            .unwrap_or(0.0) as i64,
        per_class_seconds,
    }))
}

impl MinRuntimePlugin {
    fn victims_eligible(
        &self,
        snapshot: &ClusterSnapshot,
        victims: &[&PodInfo],
        default_seconds: i64,
    ) -> bool {
        let now = Utc::now();
        victims.iter().all(|victim| {
            let Some(running_since) = victim.running_since else {
                return true;
            };
            let bound = snapshot
                .pod_groups
                .get(&victim.pod_group)
                .and_then(|group| group.priority_class.as_ref())
                .and_then(|class| self.per_class_seconds.get(class).copied())
                .unwrap_or(default_seconds);
            now - running_since >= Duration::seconds(bound)
        })
    }
}

impl Plugin for MinRuntimePlugin {
    fn name(&self) -> &str {
        "minruntime"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        let plugin = Arc::new(MinRuntimePlugin {
            preempt_min_seconds: self.preempt_min_seconds,
            reclaim_min_seconds: self.reclaim_min_seconds,
            per_class_seconds: self.per_class_seconds.clone(),
        });

        let for_preempt = plugin.clone();
        session
            .ext
            .preemptable_fns
            .push(Arc::new(move |snapshot, _preemptor, victims| {
                for_preempt.victims_eligible(snapshot, victims, for_preempt.preempt_min_seconds)
            }));

        let for_reclaim = plugin;
        session
            .ext
            .reclaimable_fns
            .push(Arc::new(move |snapshot, _reclaimer, victims| {
                for_reclaim.victims_eligible(snapshot, victims, for_reclaim.reclaim_min_seconds)
            }));
    }
}
