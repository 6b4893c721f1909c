//! Remote container runtime agent.
//!
//! The deployment controller drives containers through this interface. Calls
//! are awaited inline while the service group lock is held.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AgentError, CorralError, Result};
use crate::state::{HealthState, Instance};

/// What the agent reports after starting an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentReply {
    /// Host the instance runs on.
    pub host_id: i64,
    /// Health verdict, if the instance has a health check.
    pub health_state: Option<HealthState>,
}

/// Trait for container runtime agents.
#[async_trait]
pub trait RuntimeAgent: Send + Sync {
    /// Starts an instance on one of `candidate_hosts`.
    async fn start(&self, instance: &Instance, candidate_hosts: &BTreeSet<i64>) -> Result<AgentReply>;

    /// Waits until a started instance reports running.
    async fn wait_for_start(&self, instance: &Instance, timeout: Duration) -> Result<AgentReply>;

    /// Stops an instance.
    async fn stop(&self, instance: &Instance) -> Result<()>;

    /// Removes an instance.
    async fn remove(&self, instance: &Instance) -> Result<()>;
}

/// Agent that performs no remote work.
///
/// Places each instance on the lowest eligible host id and reports it
/// running immediately. Instances with a health check report
/// [`HealthState::Initializing`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunAgent;

impl DryRunAgent {
    /// Creates a dry-run agent.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RuntimeAgent for DryRunAgent {
    async fn start(&self, instance: &Instance, candidate_hosts: &BTreeSet<i64>) -> Result<AgentReply> {
        let host_id = candidate_hosts.first().copied().ok_or_else(|| {
            CorralError::Agent(AgentError::NoEligibleHost {
                instance_id: instance.id,
            })
        })?;

        info!("Starting {} on host {host_id}", instance.name);

        Ok(AgentReply {
            host_id,
            health_state: instance.health_state.map(|_| HealthState::Initializing),
        })
    }

    async fn wait_for_start(&self, instance: &Instance, _timeout: Duration) -> Result<AgentReply> {
        let host_id = instance
            .host_id
            .ok_or_else(|| AgentError::failed("wait", instance.id, "instance has no host"))?;

        debug!("{} reported running on host {host_id}", instance.name);

        Ok(AgentReply {
            host_id,
            health_state: instance.health_state,
        })
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        info!("Stopping {}", instance.name);
        Ok(())
    }

    async fn remove(&self, instance: &Instance) -> Result<()> {
        info!("Removing {}", instance.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_picks_lowest_host() {
        let agent = DryRunAgent::new();
        let instance = Instance::new(1, "web");
        let reply = agent
            .start(&instance, &BTreeSet::from([7, 3, 5]))
            .await
            .expect("start");
        assert_eq!(reply.host_id, 3);
        assert_eq!(reply.health_state, None);
    }

    #[tokio::test]
    async fn test_dry_run_reports_initializing_with_health_check() {
        let agent = DryRunAgent::new();
        let mut instance = Instance::new(1, "web");
        instance.health_state = Some(HealthState::Unhealthy);
        let reply = agent.start(&instance, &BTreeSet::from([1])).await.expect("start");
        assert_eq!(reply.health_state, Some(HealthState::Initializing));
    }

    #[tokio::test]
    async fn test_dry_run_without_hosts_fails() {
        let agent = DryRunAgent::new();
        let err = agent
            .start(&Instance::new(1, "web"), &BTreeSet::new())
            .await
            .expect_err("no host");
        assert!(matches!(err, CorralError::Agent(AgentError::NoEligibleHost { .. })));
    }
}
