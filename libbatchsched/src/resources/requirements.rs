use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::annotations;
use common::pod::PodSpec;
use common::quantity::{parse_cpu_millis, parse_quantity};

use super::{index_of, ResourceVector, CPU, GPU, MEMORY, PODS};

/// Shared-GPU demand. A pod asks either for whole devices (`count`), a
/// fraction of one device (`portion`), or an explicit memory slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuRequest {
    pub portion: f64,
    pub count: u32,
    pub memory: u64,
}

impl GpuRequest {
    pub fn is_shared(&self) -> bool {
        (self.portion > 0.0 && self.portion < 1.0) || (self.memory > 0 && self.count == 0)
    }

    /// Memory a shared request occupies on a device of the given size.
    pub fn shared_memory(&self, device_memory: u64) -> u64 {
        if self.memory > 0 {
            self.memory
        } else {
            (self.portion * device_memory as f64).round() as u64
        }
    }
}

/// The full demand of one pod: the resource vector, the shared-GPU triple
/// and any MIG profile counts. MIG profiles are also present in the vector
/// as scalar coordinates; the map keeps the profile names addressable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub vector: ResourceVector,
    pub gpu: GpuRequest,
    pub mig: BTreeMap<String, u64>,
    /// Per-init-container demand vectors.
    pub init: Vec<ResourceVector>,
}

impl ResourceRequirements {
    pub fn new(vector: ResourceVector) -> Self {
        Self {
            vector,
            ..Default::default()
        }
    }

    /// The quota a placement must reserve up front: the coordinate-wise max
    /// of the main-container sum and every init container.
    pub fn required_init_quota(&self) -> ResourceVector {
        let mut quota = self.vector.clone();
        for init in &self.init {
            quota = quota.max_with(init);
        }
        quota
    }

    /// Builds the requirement from a pod spec plus its annotations. Unknown
    /// resource names extend the process-wide vector index. Unparseable
    /// quantities are skipped with a warning rather than failing the pod.
    pub fn from_pod_spec(spec: &PodSpec, pod_annotations: &BTreeMap<String, String>) -> Self {
        let mut vector = ResourceVector::one_pod();
        let mut mig = BTreeMap::new();
        fill_vector(&mut vector, &mut Some(&mut mig), &spec.resources);

        let mut gpu = GpuRequest {
            count: vector.get(GPU).round() as u32,
            ..Default::default()
        };
        if let Some(fraction) = pod_annotations.get(annotations::GPU_FRACTION) {
            match fraction.parse::<f64>() {
                Ok(f) if f > 0.0 && f < 1.0 => {
                    gpu.portion = f;
                    gpu.count = 0;
                    // Fractional pods do not consume a whole device slot;
                    // the node accounts the device when its group opens.
                    vector.set(GPU, 0.0);
                }
                _ => log::warn!("ignoring invalid gpu-fraction annotation {fraction:?}"),
            }
        }
        if let Some(memory) = pod_annotations.get(annotations::GPU_MEMORY) {
            match memory.parse::<u64>() {
                Ok(m) if m > 0 => {
                    gpu.memory = m;
                    gpu.count = 0;
                    vector.set(GPU, 0.0);
                }
                _ => log::warn!("ignoring invalid gpu-memory annotation {memory:?}"),
            }
        }

        let init = spec
            .init_resources
            .iter()
            .map(|resources| {
                let mut v = ResourceVector::one_pod();
                fill_vector(&mut v, &mut None, resources);
                v
            })
            .collect();

        Self {
            vector,
            gpu,
            mig,
            init,
        }
    }
}

fn fill_vector(
    vector: &mut ResourceVector,
    mig: &mut Option<&mut BTreeMap<String, u64>>,
    resources: &BTreeMap<String, String>,
) {
    for (name, quantity) in resources {
        let parsed = match name.as_str() {
            super::CPU_NAME => parse_cpu_millis(quantity).map(|v| (CPU, v)),
            super::MEMORY_NAME => parse_quantity(quantity).map(|v| (MEMORY, v)),
            super::GPU_NAME => parse_quantity(quantity).map(|v| (GPU, v)),
            super::PODS_NAME => parse_quantity(quantity).map(|v| (PODS, v)),
            other => parse_quantity(quantity).map(|v| (index_of(other), v)),
        };
        match parsed {
            Ok((index, value)) => {
                vector.add(index, value);
                if name.starts_with("nvidia.com/mig-")
                    && let Some(map) = mig.as_deref_mut()
                {
                    *map.entry(name.clone()).or_insert(0) += value as u64;
                }
            }
            Err(e) => log::warn!("skipping resource {name:?}: {e}"),
        }
    }
}
