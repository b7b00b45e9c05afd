//! Batch-aware, fairness-driven scheduling core.
//!
//! One scheduling cycle runs over an immutable-by-convention snapshot: the
//! session opens (plugins register their extension closures, the fairness
//! engine computes per-queue shares), the configured actions speculate
//! through statements with checkpoint/rollback, and committed effects
//! leave through the commit layer as bind/evict/condition requests.

pub mod actions;
pub mod cache;
pub mod commit;
pub mod config;
pub mod cycle_state;
pub mod events;
pub mod fit_error;
pub mod info;
pub mod plugins;
pub mod resources;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod statement;
