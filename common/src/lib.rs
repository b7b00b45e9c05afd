//! Wire-format object definitions shared between the rbatch scheduler core
//! and the daemon. These are plain serde types; all scheduling semantics
//! live in `libbatchsched`.

pub mod bindrequest;
pub mod meta;
pub mod node;
pub mod pod;
pub mod podgroup;
pub mod quantity;
pub mod queue;
pub mod topology;

pub use bindrequest::{BindRequest, BindRequestSpec, BindRequestStatus};
pub use meta::ObjectMeta;
pub use node::{NodeResource, NodeSpec, NodeStatus, Taint, TaintEffect, Toleration};
pub use pod::{PodPhase, PodResource, PodSpec, PodStatus};
pub use podgroup::{
    PodGroup, PodGroupPhase, PodGroupSpec, PodGroupStatus, SchedulingCondition, SubGroupSpec,
    TopologyConstraintSpec,
};
pub use quantity::{parse_cpu_millis, parse_quantity, QuantityError};
pub use queue::{Queue, QueueResourceSpec, QueueSpec};
pub use topology::{Topology, TopologyLevelSpec, TopologySpec};

/// Annotation keys consumed by the scheduler on pods and pod groups.
pub mod annotations {
    pub const GPU_FRACTION: &str = "rbatch.io/gpu-fraction";
    pub const GPU_MEMORY: &str = "rbatch.io/gpu-memory";
    pub const RECEIVED_RESOURCE_TYPE: &str = "rbatch.io/received-resource-type";
    pub const GPU_GROUP: &str = "rbatch.io/gpu-group";
    pub const SUB_GROUP: &str = "rbatch.io/sub-group";
    pub const EXPECTED_RUNTIME: &str = "rbatch.io/expected-runtime";
    pub const REQUEUE_NOT_BEFORE: &str = "rbatch.io/requeue-not-before";
    pub const POD_GROUP: &str = "rbatch.io/pod-group";
}
