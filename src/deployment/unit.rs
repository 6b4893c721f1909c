//! Deployment units.
//!
//! A deployment unit is one replica of a service: one instance per launch
//! config, tied together by the deployment unit label. Units are rebuilt
//! from the service's expose maps on every pass.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::id_generator::DeploymentUnitInstanceIdGenerator;
use crate::allocator::{merge_labels, AllocatorService};
use crate::config::{ConfigHasher, ManagerConfig};
use crate::error::{AgentError, CorralError, DeploymentError, Result};
use crate::labels::{LABEL_SERVICE_DEPLOYMENT_UNIT, LABEL_SERVICE_HASH};
use crate::runtime::RuntimeAgent;
use crate::state::{ExposeMapDao, HealthState, Instance, InstanceState, LaunchConfig, ObjectStore, Service};

/// Collaborators a unit needs for its lifecycle operations.
#[derive(Clone, Copy)]
pub struct DeploymentContext<'a> {
    /// Object store.
    pub store: &'a dyn ObjectStore,
    /// Expose map queries.
    pub dao: &'a ExposeMapDao,
    /// Placement.
    pub allocator: &'a AllocatorService,
    /// Container runtime.
    pub agent: &'a dyn RuntimeAgent,
    /// Launch config hashing.
    pub hasher: &'a ConfigHasher,
    /// Controller settings.
    pub config: &'a ManagerConfig,
}

/// One replica of a service.
#[derive(Debug, Clone)]
pub struct DeploymentUnit {
    uuid: String,
    service: Service,
    members: Vec<Instance>,
    orphan: bool,
}

impl DeploymentUnit {
    /// Creates an empty unit with a fresh uuid.
    #[must_use]
    pub fn new(service: &Service) -> Self {
        Self::from_members(service, Uuid::new_v4().to_string(), Vec::new())
    }

    /// Creates a unit from existing member instances.
    #[must_use]
    pub fn from_members(service: &Service, uuid: impl Into<String>, members: Vec<Instance>) -> Self {
        Self {
            uuid: uuid.into(),
            service: service.clone(),
            members,
            orphan: false,
        }
    }

    /// Collects the units of a service from its live instance maps.
    ///
    /// Instances without a deployment unit label each form an orphan unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn collect(dao: &ExposeMapDao, service: &Service) -> Result<Vec<Self>> {
        let mut grouped: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        let mut units = Vec::new();

        for instance in dao.list_service_instances(service.id).await? {
            match instance.deployment_unit() {
                Some(uuid) => grouped.entry(uuid.to_string()).or_default().push(instance),
                None => {
                    let mut unit = Self::from_members(service, format!("instance-{}", instance.id), vec![instance]);
                    unit.orphan = true;
                    units.push(unit);
                }
            }
        }

        units.extend(
            grouped
                .into_iter()
                .map(|(uuid, members)| Self::from_members(service, uuid, members)),
        );
        debug!("Collected {} unit(s) for service {}", units.len(), service.name);
        Ok(units)
    }

    /// Unit uuid.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Owning service id.
    #[must_use]
    pub const fn service_id(&self) -> i64 {
        self.service.id
    }

    /// Member instances.
    #[must_use]
    pub fn members(&self) -> &[Instance] {
        &self.members
    }

    /// Lowest ordinal among the members.
    #[must_use]
    pub fn ordinal(&self) -> Option<u32> {
        self.members.iter().filter_map(|m| m.service_index).min()
    }

    /// Returns true if the unit no longer matches any desired shape: it has
    /// no unit label, a member of an unknown launch config, two members of
    /// the same launch config, or a member built from an older launch
    /// config.
    #[must_use]
    pub fn is_bad(&self, hasher: &ConfigHasher) -> bool {
        if self.orphan {
            return true;
        }

        let mut seen = std::collections::HashSet::new();
        self.members.iter().any(|member| {
            let lc_name = member.launch_config_name();
            if !seen.insert(lc_name) {
                return true;
            }
            let Some(lc) = self.service.launch_config(lc_name) else {
                return true;
            };
            member
                .config_hash()
                .is_some_and(|hash| !ConfigHasher::hashes_match(hash, &hasher.hash_launch_config(lc)))
        })
    }

    /// Returns true if a launch config has no member or a member failed.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.members.iter().any(|m| m.state == InstanceState::Error)
            || self
                .service
                .launch_config_names()
                .into_iter()
                .any(|name| self.member(name).is_none())
    }

    /// Returns true if every launch config has a running member.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.is_incomplete() && self.members.iter().all(Instance::is_running)
    }

    /// Returns true if a member's health check is still inside its startup
    /// grace window.
    #[must_use]
    pub fn is_health_check_initializing(&self, now: DateTime<Utc>, default_grace_secs: u64) -> bool {
        self.members
            .iter()
            .any(|m| self.in_grace_window(m, now, default_grace_secs))
    }

    /// Returns true if a member reports unhealthy outside its grace window.
    #[must_use]
    pub fn is_unhealthy(&self, now: DateTime<Utc>, default_grace_secs: u64) -> bool {
        self.members.iter().any(|m| {
            m.health_state == Some(HealthState::Unhealthy) && !self.in_grace_window(m, now, default_grace_secs)
        })
    }

    fn in_grace_window(&self, member: &Instance, now: DateTime<Utc>, default_grace_secs: u64) -> bool {
        let Some(check) = self
            .service
            .launch_config(member.launch_config_name())
            .and_then(|lc| lc.health_check.as_ref())
        else {
            return false;
        };
        if member.health_state == Some(HealthState::Healthy) {
            return false;
        }
        let Some(started_at) = member.started_at else {
            return false;
        };

        let grace = check.grace_period_secs.unwrap_or(default_grace_secs);
        let grace = ChronoDuration::seconds(i64::from(u32::try_from(grace).unwrap_or(u32::MAX)));
        started_at.checked_add_signed(grace).is_some_and(|end| now < end)
    }

    fn member(&self, launch_config: &str) -> Option<&Instance> {
        self.members
            .iter()
            .find(|m| m.launch_config_name() == launch_config)
    }

    /// Creates missing members and starts stopped ones.
    ///
    /// A member with no eligible host is left missing or unstarted; the
    /// unit stays incomplete until a later pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or agent fails.
    pub async fn start(
        &mut self,
        ctx: &DeploymentContext<'_>,
        generator: &mut DeploymentUnitInstanceIdGenerator,
    ) -> Result<()> {
        self.refresh(ctx).await?;

        let launch_configs: Vec<LaunchConfig> = self
            .service
            .launch_config_names()
            .into_iter()
            .filter_map(|name| self.service.launch_config(name).cloned())
            .collect();

        for lc in &launch_configs {
            let existing = self.members.iter().position(|m| m.launch_config_name() == lc.name);
            match existing {
                Some(idx) => {
                    if matches!(self.members[idx].state, InstanceState::Requested | InstanceState::Stopped) {
                        let host = self.members[idx].host_id;
                        let hosts = match host {
                            Some(host_id) => std::collections::BTreeSet::from([host_id]),
                            None => ctx.allocator.eligible_hosts(&self.members[idx]).await?,
                        };
                        if hosts.is_empty() {
                            warn!(
                                unit = %self.uuid,
                                instance = %self.members[idx].name,
                                "no eligible host, leaving member unstarted"
                            );
                            continue;
                        }
                        let mut member = self.members[idx].clone();
                        self.start_on(ctx, &mut member, &hosts).await?;
                        self.members[idx] = member;
                    }
                }
                None => self.create_member(ctx, lc, generator).await?,
            }
        }
        Ok(())
    }

    async fn create_member(
        &mut self,
        ctx: &DeploymentContext<'_>,
        lc: &LaunchConfig,
        generator: &mut DeploymentUnitInstanceIdGenerator,
    ) -> Result<()> {
        let service = &self.service;
        let index = generator.next_available_id(&lc.name);

        let system_labels = service.system_labels(&lc.name);
        let mut labels = lc.labels.clone();
        merge_labels(Some(&service.labels), Some(&mut labels));
        ctx.allocator
            .normalize_labels(service.environment_id, &system_labels, &mut labels)
            .await?;
        labels.extend(system_labels);
        labels.insert(LABEL_SERVICE_DEPLOYMENT_UNIT.to_string(), self.uuid.clone());
        labels.insert(LABEL_SERVICE_HASH.to_string(), ctx.hasher.hash_launch_config(lc));

        let mut instance = Instance::new(service.account_id, service.instance_name(&lc.name, index));
        instance.labels = labels;
        instance.environment = lc.environment.clone();
        instance.service_index = Some(index);
        instance.health_state = lc.health_check.as_ref().map(|_| HealthState::Initializing);

        let hosts = ctx.allocator.eligible_hosts(&instance).await?;
        if hosts.is_empty() {
            warn!(
                unit = %self.uuid,
                instance = %instance.name,
                "no eligible host, leaving member missing"
            );
            return Ok(());
        }

        let (mut instance, _) = ctx.dao.create_service_instance(service, instance).await?;
        info!("Created {} in unit {}", instance.name, self.uuid);

        self.start_on(ctx, &mut instance, &hosts).await?;
        self.members.push(instance);
        Ok(())
    }

    async fn start_on(
        &self,
        ctx: &DeploymentContext<'_>,
        instance: &mut Instance,
        hosts: &std::collections::BTreeSet<i64>,
    ) -> Result<()> {
        let reply = ctx
            .agent
            .start(instance, hosts)
            .await
            .map_err(|e| self.failed("start", &e))?;

        instance.host_id = Some(reply.host_id);
        instance.health_state = reply.health_state;
        instance.state = InstanceState::Starting;
        ctx.store.update_instance(instance).await
    }

    /// Waits for every starting member to report running.
    ///
    /// # Errors
    ///
    /// Returns an error if a member does not start within
    /// `agent_start_timeout_secs` or the agent fails.
    pub async fn wait_for_start(&mut self, ctx: &DeploymentContext<'_>) -> Result<()> {
        let timeout = Duration::from_secs(ctx.config.agent_start_timeout_secs);

        for idx in 0..self.members.len() {
            if self.members[idx].state != InstanceState::Starting {
                continue;
            }
            let mut member = self.members[idx].clone();

            let reply = tokio::time::timeout(timeout, ctx.agent.wait_for_start(&member, timeout))
                .await
                .map_err(|_| {
                    CorralError::Agent(AgentError::StartTimeout {
                        instance_id: member.id,
                    })
                })?
                .map_err(|e| self.failed("wait for", &e))?;

            member.host_id = Some(reply.host_id);
            member.health_state = reply.health_state;
            member.state = InstanceState::Running;
            member.started_at = Some(Utc::now());
            ctx.store.update_instance(&member).await?;
            debug!("{} running on host {}", member.name, reply.host_id);

            self.members[idx] = member;
        }
        Ok(())
    }

    /// Stops every running member.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or agent fails.
    pub async fn stop(&mut self, ctx: &DeploymentContext<'_>) -> Result<()> {
        for idx in 0..self.members.len() {
            if !matches!(self.members[idx].state, InstanceState::Running | InstanceState::Starting) {
                continue;
            }
            let mut member = self.members[idx].clone();
            ctx.agent
                .stop(&member)
                .await
                .map_err(|e| self.failed("stop", &e))?;
            member.state = InstanceState::Stopped;
            ctx.store.update_instance(&member).await?;
            self.members[idx] = member;
        }
        Ok(())
    }

    /// Removes every member and its expose maps.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or agent fails.
    pub async fn remove(&mut self, ctx: &DeploymentContext<'_>) -> Result<()> {
        let members = std::mem::take(&mut self.members);
        for member in members {
            self.remove_member(ctx, member).await?;
        }
        Ok(())
    }

    /// Removes failed members so the next start recreates them.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or agent fails.
    pub async fn cleanup_unit(&mut self, ctx: &DeploymentContext<'_>) -> Result<()> {
        let (failed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.members)
            .into_iter()
            .partition(|m| m.state == InstanceState::Error);
        self.members = kept;

        for member in failed {
            self.remove_member(ctx, member).await?;
        }
        Ok(())
    }

    async fn remove_member(&self, ctx: &DeploymentContext<'_>, mut member: Instance) -> Result<()> {
        ctx.agent
            .remove(&member)
            .await
            .map_err(|e| self.failed("remove", &e))?;
        member.state = InstanceState::Removed;
        ctx.store.update_instance(&member).await?;
        ctx.dao.remove_instance_maps(member.id).await?;
        debug!("Removed {} from unit {}", member.name, self.uuid);
        Ok(())
    }

    async fn refresh(&mut self, ctx: &DeploymentContext<'_>) -> Result<()> {
        let mut fresh = Vec::with_capacity(self.members.len());
        for member in &self.members {
            match ctx.store.get_instance(member.id).await {
                Ok(instance) if !instance.state.is_removed() => fresh.push(instance),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.members = fresh;
        Ok(())
    }

    fn failed(&self, operation: &str, err: &CorralError) -> CorralError {
        CorralError::Deployment(DeploymentError::UnitFailed {
            operation: operation.to_string(),
            unit: self.uuid.clone(),
            reason: err.to_string(),
        })
    }
}
