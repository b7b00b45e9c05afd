//! Preemption, consolidation and stale-gang cycles over wire objects.

use serial_test::serial;

use common::annotations;
use common::meta::ObjectMeta;
use common::node::{NodeResource, NodeStatus};
use common::pod::{PodPhase, PodResource, PodSpec, PodStatus as WirePodStatus};
use common::podgroup::{PodGroup, PodGroupSpec};
use common::queue::{Queue, QueueResourceSpec, QueueSpec};

use libbatchsched::commit::CommitRequest;
use libbatchsched::config::SchedulerConfig;
use libbatchsched::resources::GPU;
use libbatchsched::scheduler::Scheduler;

fn gpu_node(name: &str, gpus: u32) -> NodeResource {
    NodeResource {
        metadata: ObjectMeta::named(name),
        status: NodeStatus {
            allocatable: [
                ("cpu".to_string(), "16".to_string()),
                ("memory".to_string(), "64Gi".to_string()),
                ("nvidia.com/gpu".to_string(), gpus.to_string()),
                ("pods".to_string(), "110".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn gpu_queue(name: &str, quota: u32) -> Queue {
    Queue {
        metadata: ObjectMeta::named(name),
        spec: QueueSpec {
            parent_queue: None,
            resources: [(
                "gpu".to_string(),
                QueueResourceSpec {
                    quota: Some(quota.to_string()),
                    over_quota_weight: Some(1.0),
                    limit: None,
                },
            )]
            .into_iter()
            .collect(),
        },
    }
}

fn pod_group(name: &str, queue: &str, min_member: u32, priority: i32) -> PodGroup {
    PodGroup {
        metadata: ObjectMeta::named(name),
        spec: PodGroupSpec {
            min_member,
            queue: queue.to_string(),
            priority: Some(priority),
            preemptible: Some(false),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn gpu_pod(name: &str, group: &str, gpus: u32, node: Option<&str>) -> PodResource {
    let mut meta = ObjectMeta::named(name);
    meta.annotations
        .insert(annotations::POD_GROUP.to_string(), group.to_string());
    PodResource {
        metadata: meta,
        spec: PodSpec {
            node_name: node.map(str::to_string),
            resources: [("nvidia.com/gpu".to_string(), gpus.to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        },
        status: WirePodStatus {
            phase: if node.is_some() {
                PodPhase::Running
            } else {
                PodPhase::Pending
            },
            ..Default::default()
        },
    }
}

fn binds(requests: &[CommitRequest]) -> Vec<(&str, &str)> {
    requests
        .iter()
        .filter_map(|request| match request {
            CommitRequest::Bind { pod, node, .. } => Some((pod.as_str(), node.as_str())),
            _ => None,
        })
        .collect()
}

fn evictions(requests: &[CommitRequest]) -> Vec<&str> {
    requests
        .iter()
        .filter_map(|request| match request {
            CommitRequest::Evict { pod, .. } => Some(pod.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
#[serial]
fn test_in_queue_priority_preemption() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 4));
    cache.update_queue(gpu_queue("q1", 4));

    cache.update_pod_group(pod_group("low", "q1", 4, 0));
    for i in 0..4 {
        cache.update_pod(gpu_pod(&format!("low-{i}"), "low", 1, Some("node-1")));
    }
    cache.update_pod_group(pod_group("high", "q1", 2, 100));
    cache.update_pod(gpu_pod("high-0", "high", 1, None));
    cache.update_pod(gpu_pod("high-1", "high", 1, None));

    let (requests, _events) = scheduler.run_cycle().unwrap();
    let evicted = evictions(&requests);
    assert_eq!(evicted.len(), 2, "two victims cover the demand: {requests:?}");
    assert!(evicted.iter().all(|victim| victim.starts_with("low-")));
    let bound = binds(&requests);
    assert_eq!(bound.len(), 2);
    assert!(bound.iter().all(|(pod, _)| pod.starts_with("high-")));
}

#[test]
#[serial]
fn test_consolidation_defragments() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 2));
    cache.update_node(gpu_node("node-2", 2));
    cache.update_queue(gpu_queue("q1", 4));

    // One resident pod per node leaves one idle GPU on each: fragmented.
    cache.update_pod_group(pod_group("resident", "q1", 2, 0));
    cache.update_pod(gpu_pod("resident-0", "resident", 1, Some("node-1")));
    cache.update_pod(gpu_pod("resident-1", "resident", 1, Some("node-2")));

    // The newcomer needs 2 GPUs in one pod.
    cache.update_pod_group(pod_group("wide", "q1", 1, 0));
    cache.update_pod(gpu_pod("wide-0", "wide", 2, None));

    let (requests, _events) = scheduler.run_cycle().unwrap();
    let evicted = evictions(&requests);
    assert_eq!(evicted.len(), 1, "one resident moves: {requests:?}");
    let bound = binds(&requests);
    assert_eq!(bound.len(), 2, "the mover and the newcomer: {requests:?}");
    let moved = evicted[0];
    let moved_to = bound.iter().find(|(pod, _)| *pod == moved).unwrap().1;
    let wide_on = bound.iter().find(|(pod, _)| *pod == "wide-0").unwrap().1;
    assert_ne!(moved_to, wide_on, "the mover must leave the freed node");
}

#[test]
#[serial]
fn test_stale_gang_is_evicted() {
    let config = SchedulerConfig {
        options: libbatchsched::config::SchedulerOptions {
            default_staleness_grace_period: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(config);
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 4));
    cache.update_queue(gpu_queue("q1", 4));

    // One of two gang members holds a GPU; the other can never fit.
    cache.update_pod_group(pod_group("stuck", "q1", 2, 0));
    cache.update_pod(gpu_pod("stuck-0", "stuck", 1, Some("node-1")));
    cache.update_pod(gpu_pod("stuck-1", "stuck", 8, None));

    // First cycle records the partial mark; with a zero grace period the
    // stale-gang action fires in the same cycle.
    let (requests, events) = scheduler.run_cycle().unwrap();
    assert_eq!(evictions(&requests), vec!["stuck-0"]);
    assert!(events
        .iter()
        .any(|event| matches!(event.reason, libbatchsched::events::EventReason::GangEvicted)));

    scheduler.reconcile(&requests);
    let snapshot = scheduler.cache_mut().snapshot();
    assert_eq!(snapshot.nodes["node-1"].idle.get(GPU), 4.0);
}

#[test]
#[serial]
fn test_infinite_grace_never_evicts() {
    let config = SchedulerConfig {
        options: libbatchsched::config::SchedulerOptions {
            default_staleness_grace_period: -1,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(config);
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 4));
    cache.update_queue(gpu_queue("q1", 4));
    cache.update_pod_group(pod_group("stuck", "q1", 2, 0));
    cache.update_pod(gpu_pod("stuck-0", "stuck", 1, Some("node-1")));
    cache.update_pod(gpu_pod("stuck-1", "stuck", 8, None));

    let (requests, _events) = scheduler.run_cycle().unwrap();
    assert!(evictions(&requests).is_empty());
}
