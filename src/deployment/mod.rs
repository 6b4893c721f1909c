//! Deployment reconciliation.
//!
//! This module provides:
//! - Deployment units: the co-scheduled instances of a service and its
//!   sidekick launch configs
//! - Ordinal allocation for new unit members
//! - Planning of bad, incomplete, unhealthy and missing units
//! - The controller that runs reconciliation passes under the group lock

mod id_generator;
mod manager;
mod planner;
mod unit;

pub use id_generator::DeploymentUnitInstanceIdGenerator;
pub use manager::{Convergence, DeploymentManager, RECONCILE_ITEM};
pub use planner::{DeployPlan, ServiceDeploymentPlanner};
pub use unit::{DeploymentContext, DeploymentUnit};
