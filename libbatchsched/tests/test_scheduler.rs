//! End-to-end scheduling cycles over wire-format objects, driven through
//! the cache exactly as the daemon drives them.

use std::collections::BTreeMap;

use serial_test::serial;

use common::annotations;
use common::meta::ObjectMeta;
use common::node::{NodeResource, NodeStatus};
use common::pod::{PodPhase, PodResource, PodSpec, PodStatus as WirePodStatus};
use common::podgroup::{PodGroup, PodGroupSpec};
use common::queue::{Queue, QueueResourceSpec, QueueSpec};

use libbatchsched::commit::CommitRequest;
use libbatchsched::config::SchedulerConfig;
use libbatchsched::info::LABEL_GPU_MEMORY;
use libbatchsched::resources::GPU;
use libbatchsched::scheduler::Scheduler;
use libbatchsched::snapshot::ClusterSnapshot;

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

fn gpu_queue(name: &str, quota: u32, weight: f64) -> Queue {
    Queue {
        metadata: ObjectMeta::named(name),
        spec: QueueSpec {
            parent_queue: None,
            resources: [(
                "gpu".to_string(),
                QueueResourceSpec {
                    quota: Some(quota.to_string()),
                    over_quota_weight: Some(weight),
                    limit: None,
                },
            )]
            .into_iter()
            .collect(),
        },
    }
}

fn pod_group(name: &str, queue: &str, min_member: u32, preemptible: bool) -> PodGroup {
    PodGroup {
        metadata: ObjectMeta::named(name),
        spec: PodGroupSpec {
            min_member,
            queue: queue.to_string(),
            preemptible: Some(preemptible),
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

fn assert_conserved(snapshot: &ClusterSnapshot) {
    for node in snapshot.nodes.values() {
        let sum = node.idle.plus(&node.used).plus(&node.releasing);
        assert!(
            sum.less_equal(&node.allocatable) && node.allocatable.less_equal(&sum),
            "node {} breaks conservation: idle [{}] used [{}] releasing [{}]",
            node.name,
            node.idle,
            node.used,
            node.releasing
        );
    }
}

#[test]
#[serial]
fn test_simple_allocate() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 4));
    cache.update_queue(gpu_queue("q1", 4, 1.0));
    cache.update_pod_group(pod_group("train", "q1", 2, false));
    cache.update_pod(gpu_pod("train-0", "train", 1, None));
    cache.update_pod(gpu_pod("train-1", "train", 1, None));

    let (requests, _events) = scheduler.run_cycle().unwrap();
    let bound = binds(&requests);
    assert_eq!(bound.len(), 2);
    assert_eq!(bound[0].1, bound[1].1, "gang must land on the same node");
    assert!(evictions(&requests).is_empty());

    scheduler.reconcile(&requests);
    let snapshot = scheduler.cache_mut().snapshot();
    assert_eq!(snapshot.nodes["node-1"].idle.get(GPU), 2.0);
    assert_conserved(&snapshot);
}

#[test]
#[serial]
fn test_gang_rollback_leaves_nothing() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 3));
    cache.update_queue(gpu_queue("q1", 4, 1.0));
    cache.update_pod_group(pod_group("train", "q1", 4, false));
    for i in 0..4 {
        cache.update_pod(gpu_pod(&format!("train-{i}"), "train", 1, None));
    }

    let (requests, events) = scheduler.run_cycle().unwrap();
    assert!(binds(&requests).is_empty(), "partial gang must roll back");
    assert!(evictions(&requests).is_empty());
    assert!(
        events
            .iter()
            .any(|event| event.message.contains("insufficient nvidia.com/gpu")),
        "expected a gpu fit-error event, got {events:?}"
    );

    scheduler.reconcile(&requests);
    let snapshot = scheduler.cache_mut().snapshot();
    assert_eq!(snapshot.nodes["node-1"].idle.get(GPU), 3.0);
    assert_conserved(&snapshot);
}

#[test]
#[serial]
fn test_cross_queue_reclaim() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 4));
    cache.update_node(gpu_node("node-2", 4));
    cache.update_queue(gpu_queue("q1", 4, 1.0));
    cache.update_queue(gpu_queue("q2", 4, 1.0));

    // q2 holds all 8 GPUs preemptibly.
    cache.update_pod_group(pod_group("greedy", "q2", 8, true));
    for i in 0..8 {
        let node = if i < 4 { "node-1" } else { "node-2" };
        cache.update_pod(gpu_pod(&format!("greedy-{i}"), "greedy", 1, Some(node)));
    }
    cache.update_pod_group(pod_group("starved", "q1", 1, false));
    cache.update_pod(gpu_pod("starved-0", "starved", 1, None));

    let (requests, _events) = scheduler.run_cycle().unwrap();
    let evicted = evictions(&requests);
    assert_eq!(evicted.len(), 1, "exactly one victim: {requests:?}");
    assert!(evicted[0].starts_with("greedy-"));
    let bound = binds(&requests);
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].0, "starved-0");

    scheduler.reconcile(&requests);
    let snapshot = scheduler.cache_mut().snapshot();
    let (q2_preemptible, q2_fixed) = snapshot.queue_allocated("q2");
    assert_eq!(q2_preemptible.get(GPU) + q2_fixed.get(GPU), 7.0);
    let (q1_preemptible, q1_fixed) = snapshot.queue_allocated("q1");
    assert_eq!(q1_preemptible.get(GPU) + q1_fixed.get(GPU), 1.0);
    assert_conserved(&snapshot);
}

#[test]
#[serial]
fn test_shared_gpu_binpack() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();

    let mut node = gpu_node("node-1", 2);
    node.metadata
        .labels
        .insert(LABEL_GPU_MEMORY.to_string(), "80".to_string());
    cache.update_node(node);
    cache.update_queue(gpu_queue("q1", 2, 1.0));
    cache.update_pod_group(pod_group("infer", "q1", 3, true));
    for i in 0..3 {
        let mut pod = gpu_pod(&format!("infer-{i}"), "infer", 0, None);
        pod.spec.resources.clear();
        pod.metadata
            .annotations
            .insert(annotations::GPU_MEMORY.to_string(), "30".to_string());
        cache.update_pod(pod);
    }

    let (requests, _events) = scheduler.run_cycle().unwrap();
    let groups: Vec<Vec<String>> = requests
        .iter()
        .filter_map(|request| match request {
            CommitRequest::Bind { gpu_groups, .. } => Some(gpu_groups.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(groups.len(), 3);
    let mut flat: Vec<String> = groups.into_iter().flatten().collect();
    flat.sort();
    // Two pods packed into one device, the third on the second device.
    assert_eq!(flat.len(), 3);
    assert_eq!(flat[0], flat[1]);
    assert_ne!(flat[1], flat[2]);

    scheduler.reconcile(&requests);
    let snapshot = scheduler.cache_mut().snapshot();
    let node = &snapshot.nodes["node-1"];
    assert_eq!(node.idle.get(GPU), 0.0, "no whole device left idle");
    let free: u64 = node
        .gpu_sharing
        .allocated
        .values()
        .map(|allocated| node.gpu_memory - allocated)
        .sum();
    assert_eq!(free, (80 - 60) + (80 - 30));
    assert_conserved(&snapshot);
}

#[test]
#[serial]
fn test_topology_required_level() {
    use common::topology::{Topology, TopologyLevelSpec, TopologySpec};

    let mut scheduler = Scheduler::new(SchedulerConfig::default());
    let cache = scheduler.cache_mut();
    cache.update_topology(Topology {
        metadata: ObjectMeta::named("t1"),
        spec: TopologySpec {
            levels: vec![
                TopologyLevelSpec {
                    name: "zone".to_string(),
                    node_label: "topology.io/zone".to_string(),
                },
                TopologyLevelSpec {
                    name: "rack".to_string(),
                    node_label: "topology.io/rack".to_string(),
                },
            ],
        },
    });
    let mut zone_of = BTreeMap::new();
    for (name, zone, rack) in [
        ("n1", "z1", "r1"),
        ("n2", "z1", "r2"),
        ("n3", "z2", "r1"),
        ("n4", "z2", "r2"),
    ] {
        let mut node = gpu_node(name, 1);
        node.metadata
            .labels
            .insert("topology.io/zone".to_string(), zone.to_string());
        node.metadata
            .labels
            .insert("topology.io/rack".to_string(), rack.to_string());
        cache.update_node(node);
        zone_of.insert(name.to_string(), zone.to_string());
    }
    cache.update_queue(gpu_queue("q1", 2, 1.0));
    let mut group = pod_group("spread", "q1", 2, false);
    group.spec.topology_constraint = Some(common::podgroup::TopologyConstraintSpec {
        topology: "t1".to_string(),
        required_level: Some("zone".to_string()),
        preferred_level: None,
    });
    cache.update_pod_group(group);
    cache.update_pod(gpu_pod("spread-0", "spread", 1, None));
    cache.update_pod(gpu_pod("spread-1", "spread", 1, None));

    let (requests, _events) = scheduler.run_cycle().unwrap();
    let bound = binds(&requests);
    assert_eq!(bound.len(), 2);
    assert_eq!(
        zone_of[bound[0].1], zone_of[bound[1].1],
        "gang crossed zones: {bound:?}"
    );
}

#[test]
#[serial]
fn test_expected_runtime_requeue() {
    let config = SchedulerConfig {
        actions: "allocate,requeue".to_string(),
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(config);
    let cache = scheduler.cache_mut();
    cache.update_node(gpu_node("node-1", 4));
    cache.update_queue(gpu_queue("q1", 4, 1.0));

    let mut group = pod_group("long-runner", "q1", 2, true);
    group
        .metadata
        .annotations
        .insert(annotations::EXPECTED_RUNTIME.to_string(), "1h".to_string());
    group.status.last_start_timestamp = Some(chrono::Utc::now() - chrono::Duration::hours(2));
    cache.update_pod_group(group);
    cache.update_pod(gpu_pod("long-runner-0", "long-runner", 1, Some("node-1")));
    cache.update_pod(gpu_pod("long-runner-1", "long-runner", 1, Some("node-1")));

    let (requests, events) = scheduler.run_cycle().unwrap();
    let evicted = evictions(&requests);
    assert_eq!(evicted.len(), 2, "both pods leave: {requests:?}");

    let gate = requests.iter().find_map(|request| match request {
        CommitRequest::GroupAnnotation { group, key, value }
            if group == "long-runner" && key == annotations::REQUEUE_NOT_BEFORE =>
        {
            Some(value.clone())
        }
        _ => None,
    });
    let gate = gate.expect("cooldown annotation must be stamped");
    let gate: chrono::DateTime<chrono::Utc> = gate.parse().unwrap();
    assert!(gate > chrono::Utc::now());
    assert!(events
        .iter()
        .any(|event| matches!(event.reason, libbatchsched::events::EventReason::Requeued)));

    // The cooldown holds on the next cycle: no further evictions.
    scheduler.reconcile(&requests);
    let cache = scheduler.cache_mut();
    cache.update_pod(gpu_pod("long-runner-0", "long-runner", 1, Some("node-1")));
    cache.update_pod(gpu_pod("long-runner-1", "long-runner", 1, Some("node-1")));
    let (requests, _events) = scheduler.run_cycle().unwrap();
    assert!(evictions(&requests).is_empty());
}
