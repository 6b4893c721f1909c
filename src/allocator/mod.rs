//! Affinity constraint engine.
//!
//! This module handles:
//! - Parsing affinity rules out of scheduler labels and environment keys
//! - Filtering candidate hosts through hard constraints
//! - Merging and normalizing affinity labels inherited from services

mod candidate;
mod constraint;
mod extract;
mod service;

pub use candidate::AllocationCandidate;
pub use constraint::{AffinityOp, Constraint, ConstraintDefinition};
pub use extract::{extract_constraints_from_env, extract_constraints_from_labels, merge_labels};
pub use service::AllocatorService;
