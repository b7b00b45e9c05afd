//! Rollback restores the snapshot bit for bit, whatever the operation mix.

use serial_test::serial;

use libbatchsched::events::EventReason;
use libbatchsched::info::{NodeInfo, PodGroupInfo, PodInfo, PodStatus};
use libbatchsched::resources::{ResourceRequirements, ResourceVector, CPU, GPU, PODS};
use libbatchsched::snapshot::ClusterSnapshot;
use libbatchsched::statement::Statement;

fn node(name: &str, cpu: f64, gpus: f64, gpu_memory: u64) -> NodeInfo {
    let mut allocatable = ResourceVector::new();
    allocatable.set(CPU, cpu);
    allocatable.set(GPU, gpus);
    allocatable.set(PODS, 110.0);
    let mut node = NodeInfo::new(name, allocatable);
    node.gpu_memory = gpu_memory;
    node
}

fn whole_gpu_pod(name: &str, group: &str, gpus: f64) -> PodInfo {
    let mut v = ResourceVector::one_pod();
    v.set(CPU, 500.0);
    v.set(GPU, gpus);
    let mut requirements = ResourceRequirements::new(v);
    requirements.gpu.count = gpus as u32;
    PodInfo::new(name, group, requirements)
}

fn shared_gpu_pod(name: &str, group: &str, memory: u64) -> PodInfo {
    let mut requirements = ResourceRequirements::new(ResourceVector::one_pod());
    requirements.gpu.memory = memory;
    PodInfo::new(name, group, requirements)
}

fn fixture() -> ClusterSnapshot {
    let mut snapshot = ClusterSnapshot::new();
    snapshot
        .nodes
        .insert("n1".to_string(), node("n1", 8000.0, 4.0, 80));
    snapshot
        .nodes
        .insert("n2".to_string(), node("n2", 8000.0, 4.0, 80));

    let mut group = PodGroupInfo::new("g1", "q1", 1);
    for pod in [
        whole_gpu_pod("w1", "g1", 1.0),
        whole_gpu_pod("w2", "g1", 2.0),
        shared_gpu_pod("s1", "g1", 30),
        shared_gpu_pod("s2", "g1", 30),
    ] {
        group.pod_names.insert(pod.name.clone());
        snapshot.pods.insert(pod.name.clone(), pod);
    }
    snapshot.pod_groups.insert("g1".to_string(), group);
    snapshot
}

#[test]
#[serial]
fn test_mixed_ops_rollback_to_origin() {
    let mut snapshot = fixture();
    let reference = snapshot.clone();
    let mut commits = Vec::new();

    let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
    stmt.allocate("w1", "n1").unwrap();
    stmt.allocate("s1", "n1").unwrap();
    stmt.allocate("s2", "n1").unwrap();
    stmt.evict("w1", EventReason::GangEvicted, "test").unwrap();
    stmt.pipeline("w2", "n1", true).unwrap();
    stmt.rollback_all();
    drop(stmt);

    assert_eq!(snapshot, reference);
    assert!(commits.is_empty());
}

#[test]
#[serial]
fn test_checkpoint_rolls_back_only_the_tail() {
    let mut snapshot = fixture();
    let mut commits = Vec::new();

    let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
    stmt.allocate("w1", "n1").unwrap();
    let reference_after_first: ClusterSnapshot = stmt.snapshot().clone();

    let checkpoint = stmt.checkpoint();
    stmt.allocate("w2", "n2").unwrap();
    stmt.allocate("s1", "n1").unwrap();
    stmt.rollback(checkpoint);

    assert_eq!(stmt.snapshot(), &reference_after_first);
    assert_eq!(stmt.len(), 1);
    stmt.commit();
    assert_eq!(commits.len(), 1);
}

#[test]
#[serial]
fn test_consolidate_shared_rolls_back() {
    let mut snapshot = fixture();
    let mut commits = Vec::new();

    {
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
        stmt.allocate("s1", "n1").unwrap();
        stmt.allocate("s2", "n1").unwrap();
        stmt.commit();
    }
    let reference = snapshot.clone();
    let target = snapshot.pods["s1"].gpu_groups[0].clone();

    {
        let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
        // Move s2 out into a fresh group, then roll back.
        stmt.consolidate_shared("s2", "relocated-group").unwrap();
        assert_ne!(
            stmt.snapshot().pods["s2"].gpu_groups[0],
            stmt.snapshot().pods["s1"].gpu_groups[0]
        );
        stmt.rollback_all();
    }
    assert_eq!(snapshot, reference);
    assert_eq!(snapshot.pods["s1"].gpu_groups[0], target);
}

#[test]
#[serial]
fn test_gang_atomicity_under_partial_failure() {
    let mut snapshot = fixture();
    snapshot.pod_groups.get_mut("g1").unwrap().min_available = 4;
    let reference = snapshot.clone();
    let mut commits = Vec::new();

    let mut stmt = Statement::new(&mut snapshot, vec![], &mut commits);
    stmt.allocate("w1", "n1").unwrap();
    stmt.allocate("w2", "n1").unwrap();
    // The remaining members never place; the whole gang rolls back.
    assert!(!stmt.snapshot().is_gang_satisfied("g1"));
    stmt.rollback_all();
    drop(stmt);

    assert_eq!(snapshot, reference);
    assert_eq!(snapshot.group_member_count("g1"), 0);
}
