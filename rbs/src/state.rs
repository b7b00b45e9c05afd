//! Cluster objects loaded from YAML for self-contained operation. In a
//! full deployment the same objects arrive through informers.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use common::node::NodeResource;
use common::pod::PodResource;
use common::podgroup::PodGroup;
use common::queue::Queue;
use common::topology::Topology;
use libbatchsched::cache::Cache;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterState {
    pub nodes: Vec<NodeResource>,
    pub pods: Vec<PodResource>,
    pub pod_groups: Vec<PodGroup>,
    pub queues: Vec<Queue>,
    pub topologies: Vec<Topology>,
}

pub fn load_cluster_state(path: &Path) -> Result<ClusterState> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster state from {}", path.display()))?;
    serde_yaml::from_str(&content).context("failed to parse cluster state YAML")
}

pub fn feed_cache(cache: &mut Cache, state: ClusterState) {
    for node in state.nodes {
        cache.update_node(node);
    }
    for queue in state.queues {
        cache.update_queue(queue);
    }
    for topology in state.topologies {
        cache.update_topology(topology);
    }
    for group in state.pod_groups {
        cache.update_pod_group(group);
    }
    for pod in state.pods {
        cache.update_pod(pod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_cluster_state() {
        let yaml = r#"
nodes:
  - metadata:
      name: node-1
    status:
      allocatable:
        cpu: "8"
        memory: 16Gi
        nvidia.com/gpu: "4"
        pods: "110"
queues:
  - metadata:
      name: team-a
    spec:
      resources:
        gpu:
          quota: "4"
podGroups:
  - metadata:
      name: train-1
      annotations: {}
    spec:
      minMember: 2
      queue: team-a
pods:
  - metadata:
      name: train-1-0
      annotations:
        rbatch.io/pod-group: train-1
    spec:
      resources:
        nvidia.com/gpu: "1"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let state = load_cluster_state(file.path()).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.pod_groups[0].spec.min_member, 2);
        assert_eq!(state.pods[0].metadata.name, "train-1-0");

        let mut cache = Cache::default();
        feed_cache(&mut cache, state);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.pods.len(), 1);
    }
}
