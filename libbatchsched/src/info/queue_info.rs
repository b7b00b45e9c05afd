use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::quantity::{parse_cpu_millis, parse_quantity};
use common::queue::Queue;

use crate::resources::{self, ResourceVector};

/// Static spec of one node in the queue tree. Computed attributes
/// (deserved, fair share, allocated buckets) live in the fairness engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub parent: Option<String>,
    /// Hard entitlement per resource; absent coordinates are zero.
    pub quota: ResourceVector,
    /// Share of the residual beyond quota; absent coordinates default to 1.
    pub over_quota_weight: BTreeMap<usize, f64>,
    /// Hard ceiling per resource; absent coordinates are unlimited.
    pub limit: BTreeMap<usize, f64>,
}

impl QueueInfo {
    pub fn new(name: &str, parent: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            quota: ResourceVector::new(),
            over_quota_weight: BTreeMap::new(),
            limit: BTreeMap::new(),
        }
    }

    pub fn from_resource(queue: &Queue) -> Self {
        let mut info = Self::new(
            &queue.metadata.name,
            queue.spec.parent_queue.as_deref(),
        );
        for (name, spec) in &queue.spec.resources {
            let index = match name.as_str() {
                resources::CPU_NAME | "cpu" => resources::CPU,
                resources::MEMORY_NAME => resources::MEMORY,
                "gpu" | resources::GPU_NAME => resources::GPU,
                resources::PODS_NAME => resources::PODS,
                other => resources::index_of(other),
            };
            let parse = |q: &str| {
                if index == resources::CPU {
                    parse_cpu_millis(q)
                } else {
                    parse_quantity(q)
                }
            };
            if let Some(quota) = &spec.quota {
                match parse(quota) {
                    Ok(v) => info.quota.set(index, v),
                    Err(e) => log::warn!("queue {}: bad quota for {name}: {e}", info.name),
                }
            }
            if let Some(weight) = spec.over_quota_weight {
                info.over_quota_weight.insert(index, weight);
            }
            if let Some(limit) = &spec.limit {
                match parse(limit) {
                    Ok(v) => {
                        info.limit.insert(index, v);
                    }
                    Err(e) => log::warn!("queue {}: bad limit for {name}: {e}", info.name),
                }
            }
        }
        info
    }

    pub fn weight_of(&self, index: usize) -> f64 {
        self.over_quota_weight.get(&index).copied().unwrap_or(1.0)
    }

    /// None means unlimited.
    pub fn limit_of(&self, index: usize) -> Option<f64> {
        self.limit.get(&index).copied()
    }
}
