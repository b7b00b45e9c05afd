//! Scheduler configuration: the ordered action list, plugin tiers and the
//! operational tunables the daemon flags feed in.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_ACTIONS: &str = "allocate,consolidation,reclaim,preempt,stalegang";
pub const DEFAULT_STALENESS_GRACE_SECONDS: i64 = 60;
pub const DEFAULT_MAX_CONSOLIDATION_PREEMPTEES: usize = 16;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Comma-joined ordered action list.
    pub actions: String,
    pub tiers: Vec<Tier>,
    /// Per-action cap on jobs attempted per queue; absent means unbounded.
    pub queue_depth_per_action: BTreeMap<String, usize>,
    #[serde(flatten)]
    pub options: SchedulerOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerOptions {
    pub max_consolidation_preemptees: usize,
    /// Seconds a gang may hold a partial allocation; -1 means forever.
    pub default_staleness_grace_period: i64,
    pub detailed_fit_errors: bool,
    pub allow_consolidating_reclaim: bool,
    pub full_hierarchy_fairness: bool,
    /// Groups without an explicit preemptibility spec default to
    /// preemptible (inference-style workloads).
    pub inference_preemptible: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub plugins: Vec<PluginSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_yaml::Value>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_consolidation_preemptees: DEFAULT_MAX_CONSOLIDATION_PREEMPTEES,
            default_staleness_grace_period: DEFAULT_STALENESS_GRACE_SECONDS,
            detailed_fit_errors: false,
            allow_consolidating_reclaim: false,
            full_hierarchy_fairness: true,
            inference_preemptible: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            actions: DEFAULT_ACTIONS.to_string(),
            tiers: default_tiers(),
            queue_depth_per_action: BTreeMap::new(),
            options: SchedulerOptions::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn action_names(&self) -> Vec<String> {
        self.actions
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn queue_depth(&self, action: &str) -> Option<usize> {
        self.queue_depth_per_action.get(action).copied()
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("failed to parse scheduler config YAML")
    }
}

fn default_tiers() -> Vec<Tier> {
    let names = [
        "priority",
        "elastic",
        "taskorder",
        "subgrouporder",
        "proportion",
        "predicates",
        "nodeavailability",
        "resourcetype",
        "podaffinity",
        "nominatednode",
        "dynamicresources",
        "minruntime",
        "topology",
        "nodeplacement",
        "gpusharingorder",
        "requeue",
    ];
    vec![Tier {
        plugins: names
            .iter()
            .map(|name| PluginSpec {
                name: name.to_string(),
                arguments: BTreeMap::new(),
            })
            .collect(),
    }]
}
