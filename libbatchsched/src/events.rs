//! Structured scheduling events. Per-task and per-group outcomes are never
//! raised as errors; they are recorded here and surfaced as pod-group
//! conditions and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventReason {
    OverQuota,
    QueueLimit,
    PreemptedBy(String),
    ReclaimedBy(String),
    Consolidated,
    GangEvicted,
    Requeued,
    NotSchedulable,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::OverQuota => "OverQuota",
            EventReason::QueueLimit => "QueueLimit",
            EventReason::PreemptedBy(_) => "PreemptedBy",
            EventReason::ReclaimedBy(_) => "ReclaimedBy",
            EventReason::Consolidated => "Consolidated",
            EventReason::GangEvicted => "GangEvicted",
            EventReason::Requeued => "Requeued",
            EventReason::NotSchedulable => "NotSchedulable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventObject {
    Pod(String),
    PodGroup(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingEvent {
    pub object: EventObject,
    pub reason: EventReason,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl SchedulingEvent {
    pub fn for_group(group: &str, reason: EventReason, message: String) -> Self {
        Self {
            object: EventObject::PodGroup(group.to_string()),
            reason,
            message,
            time: Utc::now(),
        }
    }

    pub fn for_pod(pod: &str, reason: EventReason, message: String) -> Self {
        Self {
            object: EventObject::Pod(pod.to_string()),
            reason,
            message,
            time: Utc::now(),
        }
    }
}
