//! Collaborators the deployment controller drives.
//!
//! This module provides:
//! - The container runtime agent interface and a dry-run agent
//! - Service lifecycle process scheduling
//! - Versioned config-item distribution and event replies

mod agent;
mod events;
mod items;
mod process;

pub use agent::{AgentReply, DryRunAgent, RuntimeAgent};
pub use events::{EventPublisher, MemoryEventBus};
pub use items::{
    Client, ConfigItemManager, ConfigUpdate, ConfigUpdateItem, ConfigUpdateRequest, InMemoryConfigItems, ItemVersion,
    SERVICE_RESOURCE_TYPE,
};
#[cfg(test)]
pub use process::MockProcessScheduler;
pub use process::{InlineProcessScheduler, ProcessScheduler, ServiceProcess};
