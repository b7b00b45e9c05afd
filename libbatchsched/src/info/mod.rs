//! Entity info model. All entities are created from a snapshot at session
//! open and discarded at session close; cross references are ids resolved
//! through the snapshot, never owning pointers.

mod node_info;
mod pod_info;
mod podgroup_info;
mod queue_info;
mod topology_info;

pub use node_info::{
    GpuSharing, NodeInfo, LABEL_DRA_ONLY, LABEL_GPU_MEMORY, LABEL_MAX_VOLUME_CLAIMS,
    LABEL_MIG_ENABLED,
};
pub use pod_info::{
    DraClaimRef, EvictionRecord, LabelTerm, PodAffinityTerms, PodInfo, PodStatus,
    DEFAULT_SUB_GROUP,
};
pub use podgroup_info::{PodGroupInfo, SubGroupInfo, TopologyConstraint};
pub use queue_info::QueueInfo;
pub use topology_info::{TopologyInfo, TopologyLevel};
