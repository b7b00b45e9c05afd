use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use common::node::{NodeResource, Taint};
use common::quantity::{parse_cpu_millis, parse_quantity};

use crate::fit_error::FitReason;
use crate::info::pod_info::PodInfo;
use crate::resources::{self, ResourceVector, GPU, PODS};

/// Node labels the scheduler interprets directly.
pub const LABEL_DRA_ONLY: &str = "rbatch.io/dra-only";
pub const LABEL_MIG_ENABLED: &str = "rbatch.io/mig-enabled";
pub const LABEL_GPU_MEMORY: &str = "rbatch.io/gpu-memory";
pub const LABEL_MAX_VOLUME_CLAIMS: &str = "rbatch.io/max-volume-claims";

const FLOAT_SLACK: f64 = 1e-9;

/// Shared-GPU accounting per GPU group. Memory is tracked in integral
/// units, so speculative moves cannot drift.
///
/// Invariant per group: allocated = used + releasing; a group appears in
/// `releasing_groups` iff all its allocated memory is tagged releasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSharing {
    pub used: BTreeMap<String, u64>,
    pub allocated: BTreeMap<String, u64>,
    pub releasing: BTreeMap<String, u64>,
    pub releasing_groups: BTreeSet<String>,
    next_group: u32,
}

impl GpuSharing {
    fn refresh_flag(&mut self, group: &str) {
        let allocated = self.allocated.get(group).copied().unwrap_or(0);
        let used = self.used.get(group).copied().unwrap_or(0);
        if allocated > 0 && used == 0 {
            self.releasing_groups.insert(group.to_string());
        } else {
            self.releasing_groups.remove(group);
        }
    }

    pub fn group_exists(&self, group: &str) -> bool {
        self.allocated.contains_key(group)
    }

    fn fresh_group_name(&mut self) -> String {
        let name = format!("gpu-{}", self.next_group);
        self.next_group += 1;
        name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub capacity: ResourceVector,
    pub allocatable: ResourceVector,
    pub idle: ResourceVector,
    pub used: ResourceVector,
    pub releasing: ResourceVector,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub unschedulable: bool,
    /// Shared memory size of one GPU device; zero disables GPU sharing.
    pub gpu_memory: u64,
    pub gpu_sharing: GpuSharing,
    pub dra_only: bool,
    pub mig_enabled: bool,
    /// Free DRA devices per device class.
    pub dra_free: BTreeMap<String, u32>,
    pub max_volume_claims: Option<usize>,
    pub pod_names: BTreeSet<String>,
    /// Label key -> value -> count of pods carrying it; the pod-affinity
    /// accelerator, kept current by task accounting.
    pub affinity_counts: BTreeMap<String, BTreeMap<String, usize>>,
}

impl NodeInfo {
    pub fn new(name: &str, allocatable: ResourceVector) -> Self {
        Self {
            name: name.to_string(),
            capacity: allocatable.clone(),
            idle: allocatable.clone(),
            allocatable,
            used: ResourceVector::new(),
            releasing: ResourceVector::new(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            unschedulable: false,
            gpu_memory: 0,
            gpu_sharing: GpuSharing::default(),
            dra_only: false,
            mig_enabled: false,
            dra_free: BTreeMap::new(),
            max_volume_claims: None,
            pod_names: BTreeSet::new(),
            affinity_counts: BTreeMap::new(),
        }
    }

    pub fn from_resource(node: &NodeResource) -> Self {
        let mut allocatable = ResourceVector::new();
        fill(&mut allocatable, &node.status.allocatable);
        let mut capacity = ResourceVector::new();
        fill(&mut capacity, &node.status.capacity);

        let labels = node.metadata.labels.clone();
        let gpu_memory = labels
            .get(LABEL_GPU_MEMORY)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let max_volume_claims = labels
            .get(LABEL_MAX_VOLUME_CLAIMS)
            .and_then(|v| v.parse::<usize>().ok());

        Self {
            capacity,
            idle: allocatable.clone(),
            dra_only: labels.get(LABEL_DRA_ONLY).map(String::as_str) == Some("true"),
            mig_enabled: labels.get(LABEL_MIG_ENABLED).map(String::as_str) == Some("true"),
            gpu_memory,
            max_volume_claims,
            taints: node.spec.taints.clone(),
            unschedulable: node.spec.unschedulable,
            labels,
            ..Self::new(&node.metadata.name, allocatable)
        }
    }

    /// Adds a task that consumes idle capacity. GPU groups the pod is
    /// tagged with are opened on first use, each claiming a whole device.
    pub fn add_task(&mut self, pod: &PodInfo) {
        let v = &pod.requirements.vector;
        self.idle.sub_assign(v);
        self.used.add_assign(v);
        self.idle.clamp_non_negative();

        if pod.requirements.gpu.is_shared() {
            let memory = pod.requirements.gpu.shared_memory(self.gpu_memory);
            for group in pod.gpu_groups.clone() {
                if !self.gpu_sharing.group_exists(&group) {
                    self.open_group(&group);
                }
                *self.gpu_sharing.used.entry(group.clone()).or_insert(0) += memory;
                *self.gpu_sharing.allocated.entry(group.clone()).or_insert(0) += memory;
                self.gpu_sharing.refresh_flag(&group);
            }
        }
        for claim in &pod.dra_claims {
            if let Some(free) = self.dra_free.get_mut(&claim.device_class) {
                *free = free.saturating_sub(1);
            }
        }
        self.track_pod(pod);
    }

    /// Full inverse of `add_task`, used when a pod leaves the cluster.
    pub fn remove_task(&mut self, pod: &PodInfo) {
        let v = &pod.requirements.vector;
        self.idle.add_assign(v);
        self.used.sub_assign(v);
        self.used.clamp_non_negative();

        if pod.requirements.gpu.is_shared() {
            let memory = pod.requirements.gpu.shared_memory(self.gpu_memory);
            for group in pod.gpu_groups.clone() {
                if let Some(m) = self.gpu_sharing.used.get_mut(&group) {
                    *m = m.saturating_sub(memory);
                }
                if let Some(m) = self.gpu_sharing.allocated.get_mut(&group) {
                    *m = m.saturating_sub(memory);
                    if *m == 0 {
                        self.close_group(&group);
                        continue;
                    }
                }
                self.gpu_sharing.refresh_flag(&group);
            }
        }
        for claim in &pod.dra_claims {
            if let Some(free) = self.dra_free.get_mut(&claim.device_class) {
                *free += 1;
            }
        }
        self.untrack_pod(pod);
    }

    /// Moves a task's resources from used to releasing (eviction). The pod
    /// keeps its allocation until it is actually gone, so GPU groups keep
    /// their allocated memory and only retag it.
    pub fn release_task(&mut self, pod: &PodInfo) {
        let v = &pod.requirements.vector;
        self.used.sub_assign(v);
        self.releasing.add_assign(v);
        self.used.clamp_non_negative();

        if pod.requirements.gpu.is_shared() {
            let memory = pod.requirements.gpu.shared_memory(self.gpu_memory);
            for group in pod.gpu_groups.clone() {
                if let Some(m) = self.gpu_sharing.used.get_mut(&group) {
                    *m = m.saturating_sub(memory);
                }
                *self.gpu_sharing.releasing.entry(group.clone()).or_insert(0) += memory;
                self.gpu_sharing.refresh_flag(&group);
            }
        }
        self.untrack_pod(pod);
    }

    /// Places a task against capacity that is still releasing, falling back
    /// to idle for whatever releasing does not cover.
    pub fn pipeline_task(&mut self, pod: &PodInfo) {
        let v = &pod.requirements.vector;
        for (i, wanted) in v.iter() {
            let from_releasing = wanted.min(self.releasing.get(i)).max(0.0);
            self.releasing.add(i, -from_releasing);
            self.idle.add(i, -(wanted - from_releasing));
            self.used.add(i, wanted);
        }
        self.idle.clamp_non_negative();
        self.releasing.clamp_non_negative();

        if pod.requirements.gpu.is_shared() {
            let memory = pod.requirements.gpu.shared_memory(self.gpu_memory);
            for group in pod.gpu_groups.clone() {
                if !self.gpu_sharing.group_exists(&group) {
                    self.open_group(&group);
                }
                let take = memory.min(
                    self.gpu_sharing
                        .releasing
                        .get(&group)
                        .copied()
                        .unwrap_or(0),
                );
                if take > 0 {
                    *self.gpu_sharing.releasing.get_mut(&group).unwrap() -= take;
                }
                *self.gpu_sharing.used.entry(group.clone()).or_insert(0) += memory;
                *self.gpu_sharing.allocated.entry(group.clone()).or_insert(0) += memory - take;
                self.gpu_sharing.refresh_flag(&group);
            }
        }
        for claim in &pod.dra_claims {
            if let Some(free) = self.dra_free.get_mut(&claim.device_class) {
                *free = free.saturating_sub(1);
            }
        }
        self.track_pod(pod);
    }

    /// Re-associates a shared-GPU task's memory from its current group to
    /// `target`, both on this node.
    pub fn move_shared_task(&mut self, pod: &PodInfo, target: &str) {
        let memory = pod.requirements.gpu.shared_memory(self.gpu_memory);
        for group in pod.gpu_groups.clone() {
            if let Some(m) = self.gpu_sharing.used.get_mut(&group) {
                *m = m.saturating_sub(memory);
            }
            if let Some(m) = self.gpu_sharing.allocated.get_mut(&group) {
                *m = m.saturating_sub(memory);
                if *m == 0 {
                    self.close_group(&group);
                    continue;
                }
            }
            self.gpu_sharing.refresh_flag(&group);
        }
        if !self.gpu_sharing.group_exists(target) {
            self.open_group(target);
        }
        *self.gpu_sharing.used.entry(target.to_string()).or_insert(0) += memory;
        *self
            .gpu_sharing
            .allocated
            .entry(target.to_string())
            .or_insert(0) += memory;
        self.gpu_sharing.refresh_flag(target);
    }

    /// Picks the GPU group for a shared request: binpack prefers the
    /// fullest group that still fits, spread the emptiest. Falls back to a
    /// fresh group when a whole device is still idle.
    pub fn pick_shared_group(&mut self, memory: u64, pack: bool) -> Option<String> {
        let mut best: Option<(&String, u64)> = None;
        for (group, allocated) in &self.gpu_sharing.allocated {
            if allocated + memory > self.gpu_memory {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, current)) => {
                    if pack {
                        *allocated > current
                    } else {
                        *allocated < current
                    }
                }
            };
            if better {
                best = Some((group, *allocated));
            }
        }
        if let Some((group, _)) = best {
            return Some(group.clone());
        }
        if self.idle.get(GPU) >= 1.0 - FLOAT_SLACK && memory <= self.gpu_memory {
            return Some(self.gpu_sharing.fresh_group_name());
        }
        None
    }

    /// All reasons this node cannot host the pod right now. The capacity
    /// check runs against the pod's required init quota (max of main sum
    /// and any init container). `allow_pipelining` also counts releasing
    /// capacity as available.
    pub fn fit_errors(&self, pod: &PodInfo, allow_pipelining: bool) -> Vec<FitReason> {
        let requirements = &pod.requirements;
        let quota = requirements.required_init_quota();
        let mut reasons = Vec::new();
        let len = quota.len().max(self.idle.len());
        for i in 0..len {
            let wanted = quota.get(i);
            if wanted <= 0.0 {
                continue;
            }
            let mut available = self.idle.get(i);
            if allow_pipelining {
                available += self.releasing.get(i);
            }
            if wanted > available + FLOAT_SLACK {
                reasons.push(FitReason::InsufficientResource {
                    resource: resources::name_of(i),
                    requested: wanted,
                    available,
                });
            }
        }

        if requirements.gpu.is_shared() {
            if self.gpu_memory == 0 {
                reasons.push(FitReason::GpuSharingUnavailable);
            } else {
                let memory = requirements.gpu.shared_memory(self.gpu_memory);
                if !self.shared_request_fits(memory, allow_pipelining) {
                    reasons.push(FitReason::GpuSharingUnavailable);
                }
            }
        }

        for claim in &pod.dra_claims {
            let free = self.dra_free.get(&claim.device_class).copied().unwrap_or(0);
            if free == 0 {
                reasons.push(FitReason::DraDeviceUnavailable {
                    device_class: claim.device_class.clone(),
                });
            }
        }
        reasons
    }

    fn shared_request_fits(&self, memory: u64, allow_pipelining: bool) -> bool {
        for (group, allocated) in &self.gpu_sharing.allocated {
            let occupied = if allow_pipelining {
                self.gpu_sharing.used.get(group).copied().unwrap_or(0)
            } else {
                *allocated
            };
            if occupied + memory <= self.gpu_memory {
                return true;
            }
        }
        self.idle.get(GPU) >= 1.0 - FLOAT_SLACK && memory <= self.gpu_memory
    }

    /// How many copies of the demand still fit into idle capacity; used for
    /// topology domain counting.
    pub fn allocatable_count(&self, quota: &ResourceVector) -> usize {
        let mut count = usize::MAX;
        for (i, wanted) in quota.iter() {
            if wanted <= 0.0 {
                continue;
            }
            count = count.min((self.idle.get(i) / wanted + FLOAT_SLACK) as usize);
        }
        if count == usize::MAX { 0 } else { count }
    }

    fn open_group(&mut self, group: &str) {
        self.gpu_sharing.allocated.insert(group.to_string(), 0);
        self.gpu_sharing.used.insert(group.to_string(), 0);
        self.used.add(GPU, 1.0);
        self.idle.add(GPU, -1.0);
        self.idle.clamp_non_negative();
    }

    fn close_group(&mut self, group: &str) {
        self.gpu_sharing.allocated.remove(group);
        self.gpu_sharing.used.remove(group);
        self.gpu_sharing.releasing.remove(group);
        self.gpu_sharing.releasing_groups.remove(group);
        self.used.add(GPU, -1.0);
        self.idle.add(GPU, 1.0);
        self.used.clamp_non_negative();
    }

    fn track_pod(&mut self, pod: &PodInfo) {
        self.pod_names.insert(pod.name.clone());
        for (key, value) in &pod.labels {
            *self
                .affinity_counts
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_insert(0) += 1;
        }
    }

    fn untrack_pod(&mut self, pod: &PodInfo) {
        self.pod_names.remove(&pod.name);
        for (key, value) in &pod.labels {
            if let Some(values) = self.affinity_counts.get_mut(key)
                && let Some(count) = values.get_mut(value)
            {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    values.remove(value);
                }
            }
        }
    }

    /// Pods of `label` value on this node, the accelerator the pod-affinity
    /// predicate works from.
    pub fn pods_with_label(&self, key: &str, value: &str) -> usize {
        self.affinity_counts
            .get(key)
            .and_then(|values| values.get(value))
            .copied()
            .unwrap_or(0)
    }
}

fn fill(vector: &mut ResourceVector, quantities: &BTreeMap<String, String>) {
    for (name, quantity) in quantities {
        let parsed = match name.as_str() {
            resources::CPU_NAME => parse_cpu_millis(quantity).map(|v| (resources::CPU, v)),
            resources::MEMORY_NAME => parse_quantity(quantity).map(|v| (resources::MEMORY, v)),
            resources::GPU_NAME => parse_quantity(quantity).map(|v| (GPU, v)),
            resources::PODS_NAME => parse_quantity(quantity).map(|v| (PODS, v)),
            other => parse_quantity(quantity).map(|v| (resources::index_of(other), v)),
        };
        match parsed {
            Ok((index, value)) => vector.set(index, value),
            Err(e) => log::warn!("skipping node resource {name:?}: {e}"),
        }
    }
}
