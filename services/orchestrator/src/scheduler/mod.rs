//! Node selection for incoming tasks.
//!
//! - `scoring`: pure load score and capacity admission
//! - `selector`: warm-pool claim, then capacity ranking over running nodes

mod scoring;
mod selector;

pub use scoring::{node_has_capacity, score_node_load, CapacityThresholds};
pub use selector::{NodeSelection, NodeSelector, SelectionRequest};
