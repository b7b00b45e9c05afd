//! The only path from a scheduling decision to the outside world. A
//! committed statement is translated into `CommitRequest`s; a bounded pool
//! of status-recording workers drains them into a `CommitSink` with
//! retries. Everything before this module is speculation.

mod workers;

pub use workers::{CommitSink, CommitWorkerPool, LoggingSink, RecordingSink};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::bindrequest::{BindRequest, BindRequestSpec};
use common::meta::ObjectMeta;

use crate::events::EventReason;

pub const DEFAULT_STATUS_RECORDING_WORKERS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommitRequest {
    /// Create a BindRequest for a committed allocation. `wait_for_release`
    /// marks pipelined placements whose bind must wait for victims.
    Bind {
        pod: String,
        node: String,
        gpu_groups: Vec<String>,
        wait_for_release: bool,
    },
    /// Evict a pod (delete with grace) with a structured reason.
    Evict {
        pod: String,
        reason: EventReason,
        message: String,
    },
    PodCondition {
        pod: String,
        reason: String,
        message: String,
    },
    GroupCondition {
        group: String,
        reason: String,
        message: String,
    },
    GroupAnnotation {
        group: String,
        key: String,
        value: String,
    },
}

impl CommitRequest {
    /// Materializes the BindRequest object a committed bind creates on the
    /// platform. Names carry a random suffix so retried creates never
    /// collide with a half-created predecessor.
    pub fn as_bind_request(&self) -> Option<BindRequest> {
        let CommitRequest::Bind {
            pod,
            node,
            gpu_groups,
            wait_for_release,
        } = self
        else {
            return None;
        };
        Some(BindRequest {
            metadata: ObjectMeta::named(&format!("{pod}-{}", Uuid::new_v4().simple())),
            spec: BindRequestSpec {
                pod_name: pod.clone(),
                selected_node: node.clone(),
                selected_gpu_groups: gpu_groups.clone(),
                wait_for_release: *wait_for_release,
            },
            status: Default::default(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommitRequest::Bind { .. } => "bind",
            CommitRequest::Evict { .. } => "evict",
            CommitRequest::PodCondition { .. } => "pod-condition",
            CommitRequest::GroupCondition { .. } => "group-condition",
            CommitRequest::GroupAnnotation { .. } => "group-annotation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_materializes_a_bind_request() {
        let request = CommitRequest::Bind {
            pod: "train-0".to_string(),
            node: "node-1".to_string(),
            gpu_groups: vec!["gpu-0".to_string()],
            wait_for_release: true,
        };
        let bind = request.as_bind_request().unwrap();
        assert!(bind.metadata.name.starts_with("train-0-"));
        assert_eq!(bind.spec.pod_name, "train-0");
        assert_eq!(bind.spec.selected_node, "node-1");
        assert_eq!(bind.spec.selected_gpu_groups, vec!["gpu-0".to_string()]);
        assert!(bind.spec.wait_for_release);

        // Fresh names per materialization.
        assert_ne!(
            request.as_bind_request().unwrap().metadata.name,
            request.as_bind_request().unwrap().metadata.name
        );
    }

    #[test]
    fn test_only_binds_materialize() {
        let request = CommitRequest::Evict {
            pod: "p".to_string(),
            reason: EventReason::Requeued,
            message: String::new(),
        };
        assert!(request.as_bind_request().is_none());
        assert_eq!(request.kind(), "evict");
    }
}
