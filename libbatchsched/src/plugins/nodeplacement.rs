//! Top-level node-order aggregation: per resource, a binpack or spread
//! strategy chosen by configuration. GPU defaults to binpack so fractions
//! and whole devices concentrate; CPU and memory default to spread.

use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::info::NodeInfo;
use crate::plugins::{gpupack, gpuspread, string_argument, Plugin, PluginArguments};
use crate::resources::{CPU, GPU, MEMORY};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Binpack,
    Spread,
}

pub struct NodePlacementPlugin {
    gpu: Strategy,
    cpu: Strategy,
    memory: Strategy,
}

pub fn factory(arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(NodePlacementPlugin {
        gpu: parse_strategy(arguments, "gpu", Strategy::Binpack)?,
        cpu: parse_strategy(arguments, "cpu", Strategy::Spread)?,
        memory: parse_strategy(arguments, "memory", Strategy::Spread)?,
    }))
}

fn parse_strategy(
    arguments: &PluginArguments,
    key: &str,
    default: Strategy,
) -> Result<Strategy, SchedulerError> {
    match string_argument(arguments, key).as_deref() {
        None => Ok(default),
        Some("binpack") => Ok(Strategy::Binpack),
        Some("spread") => Ok(Strategy::Spread),
        Some(other) => Err(SchedulerError::Config(format!(
            "placement strategy for {key} must be binpack or spread, got {other:?}"
        ))),
    }
}

fn utilization(node: &NodeInfo, index: usize) -> f64 {
    let allocatable = node.allocatable.get(index);
    if allocatable <= 0.0 {
        return 0.0;
    }
    node.used.get(index) / allocatable
}

impl Plugin for NodePlacementPlugin {
    fn name(&self) -> &str {
        "nodeplacement"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        let gpu = self.gpu;
        session.ext.node_order_fns.push(Arc::new(move |_state, _pod, node| {
            match gpu {
                Strategy::Binpack => gpupack::score(node),
                Strategy::Spread => gpuspread::score(node),
            }
        }));

        let cpu = self.cpu;
        let memory = self.memory;
        session.ext.node_order_fns.push(Arc::new(move |_state, _pod, node| {
            let mut total = 0.0;
            for (index, strategy) in [(CPU, cpu), (MEMORY, memory)] {
                let u = utilization(node, index);
                total += match strategy {
                    Strategy::Binpack => 50.0 * u,
                    Strategy::Spread => 50.0 * (1.0 - u),
                };
            }
            total
        }));
    }
}
