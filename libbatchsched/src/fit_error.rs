//! Typed scheduling failures.
//!
//! Fit errors are expected per-node outcomes: they enumerate what a node is
//! missing and aggregate into a histogram per task, never into concatenated
//! strings. Admission and topology errors are queue- and constraint-level
//! rejections. Only `SchedulerError` aborts a cycle.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One reason a node cannot host a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitReason {
    InsufficientResource {
        resource: String,
        requested: f64,
        available: f64,
    },
    NodeUnschedulable,
    UntoleratedTaint {
        key: String,
        value: String,
    },
    NodeSelectorMismatch {
        key: String,
    },
    AffinityMismatch,
    GpuSharingUnavailable,
    VolumeLimitExceeded {
        limit: usize,
    },
    DraDeviceUnavailable {
        device_class: String,
    },
    ResourceTypeMismatch {
        detail: String,
    },
}

impl FitReason {
    /// Short form used as the histogram key.
    pub fn short(&self) -> String {
        match self {
            FitReason::InsufficientResource { resource, .. } => {
                format!("insufficient {resource}")
            }
            FitReason::NodeUnschedulable => "node unschedulable".to_string(),
            FitReason::UntoleratedTaint { key, .. } => format!("untolerated taint {key}"),
            FitReason::NodeSelectorMismatch { key } => format!("node selector {key}"),
            FitReason::AffinityMismatch => "pod affinity".to_string(),
            FitReason::GpuSharingUnavailable => "no shared gpu capacity".to_string(),
            FitReason::VolumeLimitExceeded { .. } => "volume limit".to_string(),
            FitReason::DraDeviceUnavailable { device_class } => {
                format!("no {device_class} device")
            }
            FitReason::ResourceTypeMismatch { .. } => "resource type".to_string(),
        }
    }

    pub fn detailed(&self) -> String {
        match self {
            FitReason::InsufficientResource {
                resource,
                requested,
                available,
            } => format!("requested {requested} {resource}, {available} available"),
            FitReason::UntoleratedTaint { key, value } => {
                format!("untolerated taint {{{key}: {value}}}")
            }
            FitReason::NodeSelectorMismatch { key } => {
                format!("node selector {key} does not match")
            }
            FitReason::VolumeLimitExceeded { limit } => {
                format!("node volume limit {limit} exceeded")
            }
            FitReason::ResourceTypeMismatch { detail } => detail.clone(),
            other => other.short(),
        }
    }
}

/// All reasons one node rejected one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitError {
    pub node: String,
    pub reasons: Vec<FitReason>,
}

impl FitError {
    pub fn new(node: &str, reasons: Vec<FitReason>) -> Self {
        Self {
            node: node.to_string(),
            reasons,
        }
    }

    pub fn single(node: &str, reason: FitReason) -> Self {
        Self::new(node, vec![reason])
    }
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reasons: Vec<String> = self.reasons.iter().map(|r| r.short()).collect();
        write!(f, "node {}: {}", self.node, reasons.join(", "))
    }
}

/// Aggregates per-node fit reasons for one task or job: short reason ->
/// number of nodes that rejected with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitErrorHistogram {
    counts: BTreeMap<String, usize>,
}

impl FitErrorHistogram {
    pub fn add(&mut self, error: &FitError) {
        for reason in &error.reasons {
            *self.counts.entry(reason.short()).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: &FitErrorHistogram) {
        for (reason, count) in &other.counts {
            *self.counts.entry(reason.clone()).or_insert(0) += count;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &BTreeMap<String, usize> {
        &self.counts
    }
}

impl fmt::Display for FitErrorHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (reason, count) in &self.counts {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{count} node(s) {reason}")?;
            first = false;
        }
        Ok(())
    }
}

/// Queue-level admission rejections.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdmissionError {
    #[error("job would exceed limit of queue {queue} on {resource}")]
    OverLimit { queue: String, resource: String },
    #[error("non-preemptible job would exceed deserved quota of queue {queue} on {resource}")]
    NonPreemptibleOverQuota { queue: String, resource: String },
    #[error("job would breach {what} of ancestor queue {queue} on {resource}")]
    ParentQueueLimit {
        queue: String,
        resource: String,
        what: &'static str,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TopologyError {
    #[error("topology {topology}: required level {level} does not exist")]
    RequiredLevelMissing { topology: String, level: String },
    #[error("topology {topology}: no domain at level {level} fits {pods} pods")]
    NoDomainFits {
        topology: String,
        level: String,
        pods: usize,
    },
    #[error("topology {topology} is not known")]
    UnknownTopology { topology: String },
}

/// Any reason a task or job was turned away, carried through extension
/// points that can fail for more than one reason.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulingRejection {
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl std::error::Error for FitError {}

/// Session-fatal errors: these abort the cycle without committing.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("malformed configuration: {0}")]
    Config(String),
}
