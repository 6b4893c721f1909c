// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Corral
//!
//! Affinity-aware placement and idempotent deployment reconciliation for
//! container services.
//!
//! ## Overview
//!
//! A service runs as a set of deployment units. Each unit holds one instance
//! per launch config (the primary plus its sidekicks), and the units of a
//! service are kept at the service's scale. Corral:
//!
//! - Parses affinity rules out of scheduler labels and environment keys
//! - Filters the hosts an instance may run on through hard constraints
//! - Reconciles units toward the desired scale and configuration
//! - Serializes passes over a service group with per-service locks
//!
//! ## Architecture
//!
//! Reconciliation is driven by versioned config items:
//!
//! 1. **Request**: bumping a service's `reconcile` item enqueues an update
//! 2. **Pass**: the deployment manager locks the service group, plans the
//!    units and runs its mutation phases
//! 3. **Acknowledge**: the applied version is recorded and a reply is sent,
//!    releasing anyone waiting on the item
//!
//! ## Modules
//!
//! - [`allocator`]: Affinity constraint extraction and host filtering
//! - [`config`]: Inventory parsing, validation and launch config hashing
//! - [`deployment`]: Deployment units, planning and the reconciliation controller
//! - [`runtime`]: Agent, process scheduler, config items and event replies
//! - [`state`]: Entity storage and service locks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! hosts:
//!   - id: 1
//!     account_id: 1
//!     name: node-a
//!     labels:
//!       region: west
//!
//! services:
//!   - id: 1
//!     account_id: 1
//!     environment_id: 1
//!     stack_name: shop
//!     name: web
//!     state: active
//!     scale: 2
//!     launch_configs:
//!       - image: nginx
//!         labels:
//!           io.rancher.scheduler.affinity:host_label: region=west
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod allocator;
pub mod cli;
pub mod config;
pub mod deployment;
pub mod error;
pub mod labels;
pub mod runtime;
pub mod state;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use allocator::{AllocationCandidate, AllocatorService, Constraint};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Inventory, ManagerConfig};
pub use deployment::{Convergence, DeploymentManager, DeploymentUnit, ServiceDeploymentPlanner};
pub use error::{CorralError, Result};
pub use runtime::{ConfigItemManager, DryRunAgent, InMemoryConfigItems, ProcessScheduler, RuntimeAgent};
pub use state::{ExposeMapDao, LockManager, MemoryStore, ObjectStore};
