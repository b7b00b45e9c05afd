//! Resource accounting primitives.
//!
//! All quantities are tracked as vectors indexed through a process-wide
//! name index so that arbitrary scalar resources (MIG profiles, custom
//! devices, storage classes) extend the same arithmetic as the core four.

mod requirements;
mod vector;

pub use requirements::{GpuRequest, ResourceRequirements};
pub use vector::ResourceVector;

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

/// CPU in millicores.
pub const CPU: usize = 0;
/// Memory in bytes.
pub const MEMORY: usize = 1;
/// Whole GPUs.
pub const GPU: usize = 2;
/// Pod slots. Always present; every pod occupies one.
pub const PODS: usize = 3;

pub const CPU_NAME: &str = "cpu";
pub const MEMORY_NAME: &str = "memory";
pub const GPU_NAME: &str = "nvidia.com/gpu";
pub const PODS_NAME: &str = "pods";

struct NameIndex {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl NameIndex {
    fn new() -> Self {
        let mut index = Self {
            names: Vec::new(),
            by_name: HashMap::new(),
        };
        for name in [CPU_NAME, MEMORY_NAME, GPU_NAME, PODS_NAME] {
            index.intern(name);
        }
        index
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&i) = self.by_name.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), i);
        i
    }
}

static INDEX: Lazy<RwLock<NameIndex>> = Lazy::new(|| RwLock::new(NameIndex::new()));

/// Returns the vector index for a resource name, interning it on first use.
/// The index is process-wide: it grows as nodes with new resource names are
/// observed and is never compacted.
pub fn index_of(name: &str) -> usize {
    if let Some(&i) = INDEX.read().unwrap().by_name.get(name) {
        return i;
    }
    INDEX.write().unwrap().intern(name)
}

/// Looks up a resource name without interning.
pub fn lookup(name: &str) -> Option<usize> {
    INDEX.read().unwrap().by_name.get(name).copied()
}

pub fn name_of(index: usize) -> String {
    let guard = INDEX.read().unwrap();
    guard
        .names
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("resource#{index}"))
}

/// Number of resource names seen so far.
pub fn index_len() -> usize {
    INDEX.read().unwrap().names.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_core_indices_are_stable() {
        assert_eq!(index_of(CPU_NAME), CPU);
        assert_eq!(index_of(MEMORY_NAME), MEMORY);
        assert_eq!(index_of(GPU_NAME), GPU);
        assert_eq!(index_of(PODS_NAME), PODS);
    }

    #[test]
    #[serial]
    fn test_interning_is_idempotent() {
        let a = index_of("nvidia.com/mig-1g.5gb");
        let b = index_of("nvidia.com/mig-1g.5gb");
        assert_eq!(a, b);
        assert_eq!(name_of(a), "nvidia.com/mig-1g.5gb");
        assert_eq!(lookup("nvidia.com/mig-1g.5gb"), Some(a));
    }
}
