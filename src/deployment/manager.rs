//! Deployment reconciliation controller.
//!
//! The manager drives the units of a service group toward the desired
//! scale and configuration. Every mutating pass holds the group lock and
//! runs four phases in order: delete bad units, clean up incomplete units,
//! start units, delete unhealthy units.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::id_generator::DeploymentUnitInstanceIdGenerator;
use super::planner::ServiceDeploymentPlanner;
use super::unit::{DeploymentContext, DeploymentUnit};
use crate::allocator::AllocatorService;
use crate::config::{ConfigHasher, ManagerConfig};
use crate::error::{DeploymentError, ProcessError, Result};
use crate::runtime::{
    Client, ConfigItemManager, ConfigUpdate, ConfigUpdateItem, ConfigUpdateRequest, EventPublisher,
    ProcessScheduler, RuntimeAgent, ServiceProcess,
};
use crate::state::{ExposeMapDao, LockManager, ObjectStore, Service, ServiceState};

/// Config item that requests a reconciliation pass for a service.
pub const RECONCILE_ITEM: &str = "reconcile";

/// Outcome of scheduling the group's lifecycle processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// Every process was scheduled.
    Converged,
    /// A service was already transitioning or refused the process; the
    /// next pass picks it up.
    RetryLater,
    /// Scheduling failed outright.
    Fatal(String),
}

impl From<&ProcessError> for Convergence {
    fn from(err: &ProcessError) -> Self {
        match err {
            ProcessError::AlreadyTransitioning { .. } | ProcessError::Cancelled { .. } => Self::RetryLater,
            ProcessError::Failed { .. } => Self::Fatal(err.to_string()),
        }
    }
}

/// Reconciles deployment units of services.
pub struct DeploymentManager {
    store: Arc<dyn ObjectStore>,
    agent: Arc<dyn RuntimeAgent>,
    scheduler: Arc<dyn ProcessScheduler>,
    items: Arc<dyn ConfigItemManager>,
    events: Arc<dyn EventPublisher>,
    dao: ExposeMapDao,
    allocator: AllocatorService,
    locks: LockManager,
    hasher: ConfigHasher,
    config: ManagerConfig,
}

impl DeploymentManager {
    /// Creates a manager over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        agent: Arc<dyn RuntimeAgent>,
        scheduler: Arc<dyn ProcessScheduler>,
        items: Arc<dyn ConfigItemManager>,
        events: Arc<dyn EventPublisher>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            dao: ExposeMapDao::new(Arc::clone(&store)),
            allocator: AllocatorService::new(Arc::clone(&store)),
            locks: LockManager::new(Duration::from_secs(config.lock_wait_timeout_secs)),
            hasher: ConfigHasher::new(),
            store,
            agent,
            scheduler,
            items,
            events,
            config,
        }
    }

    /// The allocator this manager places instances with.
    #[must_use]
    pub const fn allocator(&self) -> &AllocatorService {
        &self.allocator
    }

    fn context(&self) -> DeploymentContext<'_> {
        DeploymentContext {
            store: self.store.as_ref(),
            dao: &self.dao,
            allocator: &self.allocator,
            agent: self.agent.as_ref(),
            hasher: &self.hasher,
            config: &self.config,
        }
    }

    /// Runs a reconciliation pass for the service and its sidekicks.
    ///
    /// # Errors
    ///
    /// Returns an error if the group lock cannot be acquired, a unit
    /// operation fails, or scheduling a service process fails outright.
    pub async fn activate(&self, service: &Service) -> Result<()> {
        self.activate_at(service, false, Utc::now()).await.map(|_| ())
    }

    /// Returns false if the service's group needs reconciling and no unit
    /// is still inside its health check grace window.
    ///
    /// Reads without taking the group lock.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn is_healthy(&self, service: &Service) -> Result<bool> {
        self.is_healthy_at(service, Utc::now()).await
    }

    pub(crate) async fn is_healthy_at(&self, service: &Service, now: DateTime<Utc>) -> Result<bool> {
        Ok(!self.activate_at(service, true, now).await?)
    }

    /// Shared pass behind [`Self::activate`] and [`Self::is_healthy`].
    ///
    /// Returns true only when `check_state` is set and the group is still
    /// converging.
    async fn activate_at(&self, service: &Service, check_state: bool, now: DateTime<Utc>) -> Result<bool> {
        if !service.is_active_eligible() {
            return Ok(false);
        }

        let group_ids = self.service_group(service).await?;
        let _lock = if check_state {
            None
        } else {
            Some(self.locks.lock_services(group_ids.iter().copied()).await?)
        };

        let current = match self.store.get_service(service.id).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if !current.is_active_eligible() {
            debug!("Service {} left active states before the pass started", current.name);
            return Ok(false);
        }

        let services = self.load_group(&group_ids).await?;
        let units = self.collect_units(&services).await?;
        let mut planner = ServiceDeploymentPlanner::new(
            services.clone(),
            units,
            &self.hasher,
            now,
            self.config.default_health_grace_secs,
        );

        let need_to_reconcile =
            services.iter().any(|s| s.state == ServiceState::Inactive) || planner.need_to_reconcile_deployment();
        if !need_to_reconcile {
            return Ok(false);
        }

        if check_state {
            return Ok(!planner.is_health_check_initializing());
        }

        match self.activate_services(&services).await {
            Convergence::Converged => {}
            Convergence::RetryLater => {
                debug!("Service group of {} is busy, leaving state changes for the next pass", current.name);
            }
            Convergence::Fatal(reason) => {
                return Err(DeploymentError::Aborted {
                    service_id: current.id,
                    reason,
                }
                .into());
            }
        }

        self.activate_deployment_units(&mut planner).await?;
        Ok(false)
    }

    /// Ids of the service and every service linked to it through sidekick
    /// references in either direction, ascending.
    async fn service_group(&self, service: &Service) -> Result<Vec<i64>> {
        let services = self.store.list_services().await?;
        let mut links: HashMap<i64, Vec<i64>> = HashMap::new();
        for s in services.iter().filter(|s| s.account_id == service.account_id) {
            for sidekick in &s.sidekick_service_ids {
                links.entry(s.id).or_default().push(*sidekick);
                links.entry(*sidekick).or_default().push(s.id);
            }
        }
        for sidekick in &service.sidekick_service_ids {
            links.entry(service.id).or_default().push(*sidekick);
        }

        let mut group = BTreeSet::from([service.id]);
        let mut queue = VecDeque::from([service.id]);
        while let Some(id) = queue.pop_front() {
            for linked in links.get(&id).into_iter().flatten() {
                if group.insert(*linked) {
                    queue.push_back(*linked);
                }
            }
        }
        Ok(group.into_iter().collect())
    }

    /// Group members a pass should plan for: active-eligible or inactive.
    async fn load_group(&self, ids: &[i64]) -> Result<Vec<Service>> {
        let mut services = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_service(*id).await {
                Ok(service)
                    if service.removed.is_none()
                        && (service.is_active_eligible() || service.state == ServiceState::Inactive) =>
                {
                    services.push(service);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => warn!("Sidekick service {id} does not exist"),
                Err(e) => return Err(e),
            }
        }
        Ok(services)
    }

    async fn collect_units(&self, services: &[Service]) -> Result<Vec<DeploymentUnit>> {
        let mut units = Vec::new();
        for service in services {
            units.extend(DeploymentUnit::collect(&self.dao, service).await?);
        }
        Ok(units)
    }

    async fn activate_services(&self, services: &[Service]) -> Convergence {
        for service in services {
            let process = match service.state {
                ServiceState::Inactive => ServiceProcess::Activate,
                ServiceState::Active => ServiceProcess::Update,
                _ => continue,
            };
            if let Err(e) = self.scheduler.schedule(process, service.id).await {
                let outcome = Convergence::from(&e);
                match &outcome {
                    Convergence::RetryLater => debug!("Not escalating {process} on {}: {e}", service.name),
                    _ => warn!("Failed to schedule {process} on {}: {e}", service.name),
                }
                return outcome;
            }
        }
        Convergence::Converged
    }

    async fn activate_deployment_units(&self, planner: &mut ServiceDeploymentPlanner) -> Result<()> {
        self.delete_bad_units(planner).await?;
        self.cleanup_incomplete_units(planner).await?;
        self.start_units(planner).await?;
        self.cleanup_unhealthy_units(planner).await
    }

    async fn delete_bad_units(&self, planner: &ServiceDeploymentPlanner) -> Result<()> {
        let ctx = self.context();
        let units = planner.bad_units().to_vec();
        if !units.is_empty() {
            info!("Deleting {} bad unit(s)", units.len());
        }
        for mut unit in units {
            unit.remove(&ctx).await?;
        }
        Ok(())
    }

    async fn cleanup_incomplete_units(&self, planner: &ServiceDeploymentPlanner) -> Result<()> {
        let ctx = self.context();
        let units = planner.incomplete_units().to_vec();
        if !units.is_empty() {
            info!("Cleaning up {} incomplete unit(s)", units.len());
        }
        for mut unit in units {
            unit.cleanup_unit(&ctx).await?;
        }
        Ok(())
    }

    async fn start_units(&self, planner: &mut ServiceDeploymentPlanner) -> Result<()> {
        let ctx = self.context();
        let mut generators = self.populate_used_ids(planner.services()).await?;
        let plan = planner.deploy();

        if !plan.remove.is_empty() {
            info!("Removing {} surplus unit(s)", plan.remove.len());
        }
        for mut unit in plan.remove {
            unit.remove(&ctx).await?;
        }

        if !plan.start.is_empty() {
            info!("Starting {} unit(s)", plan.start.len());
        }
        let mut started = Vec::with_capacity(plan.start.len());
        for mut unit in plan.start {
            let generator = generators.entry(unit.service_id()).or_default();
            unit.start(&ctx, generator).await?;
            started.push(unit);
        }
        for unit in &mut started {
            unit.wait_for_start(&ctx).await?;
        }
        Ok(())
    }

    async fn cleanup_unhealthy_units(&self, planner: &ServiceDeploymentPlanner) -> Result<()> {
        let ctx = self.context();
        let units = planner.unhealthy_units().to_vec();
        if !units.is_empty() {
            info!("Deleting {} unhealthy unit(s)", units.len());
        }
        for mut unit in units {
            unit.remove(&ctx).await?;
        }
        Ok(())
    }

    async fn populate_used_ids(
        &self,
        services: &[Service],
    ) -> Result<HashMap<i64, DeploymentUnitInstanceIdGenerator>> {
        let mut generators = HashMap::new();
        for service in services {
            let mut generator = DeploymentUnitInstanceIdGenerator::default();
            for instance in self.dao.list_service_instances(service.id).await? {
                if let Some(index) = instance.service_index {
                    generator.mark_used(instance.launch_config_name(), index);
                }
            }
            generators.insert(service.id, generator);
        }
        Ok(generators)
    }

    /// Stops every unit of the service. Sidekicks are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired or a unit fails to
    /// stop.
    pub async fn deactivate(&self, service: &Service) -> Result<()> {
        let _lock = self.locks.lock_service(service.id).await?;
        let ctx = self.context();

        let units = DeploymentUnit::collect(&self.dao, service).await?;
        info!("Stopping {} unit(s) of {}", units.len(), service.name);
        for mut unit in units {
            unit.stop(&ctx).await?;
        }
        Ok(())
    }

    /// Stops and removes every unit of the service, then releases its IP
    /// address and hostname bindings. Sidekicks are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired or a unit fails to
    /// be removed.
    pub async fn remove(&self, service: &Service) -> Result<()> {
        let lock = self.locks.lock_service(service.id).await?;
        let ctx = self.context();

        let units = DeploymentUnit::collect(&self.dao, service).await?;
        info!("Removing {} unit(s) of {}", units.len(), service.name);
        for mut unit in units {
            unit.stop(&ctx).await?;
            unit.remove(&ctx).await?;
        }
        self.dao.remove_service_maps(service.id).await?;

        drop(lock);
        self.locks.forget_service(service.id).await;
        Ok(())
    }

    /// Requests a reconciliation pass for each service.
    ///
    /// Bumps each service's `reconcile` item; the pass runs when the
    /// resulting update is handled by [`Self::service_update`].
    ///
    /// # Errors
    ///
    /// Returns an error if an update cannot be enqueued.
    pub async fn reconcile_services(&self, services: &[Service]) -> Result<()> {
        for service in services {
            let mut request =
                ConfigUpdateRequest::new(Client::service(service.id)).with_item(ConfigUpdateItem::new(RECONCILE_ITEM));
            self.items.update_config(&mut request).await?;
        }
        Ok(())
    }

    /// Handles a `reconcile` update: activates the service unless the
    /// requested version was already applied, marks it applied and replies.
    ///
    /// # Errors
    ///
    /// Returns an error if activation fails; the version is then left
    /// unapplied and no reply is sent.
    pub async fn service_update(&self, update: &ConfigUpdate) -> Result<()> {
        let Some(resource_id) = update.resource_id else {
            return Ok(());
        };
        let client = Client::service(resource_id);

        let requested = self.items.get_requested_version(&client, RECONCILE_ITEM).await?;
        let applied = self.items.get_applied_version(&client, RECONCILE_ITEM).await?;

        if matches!((requested, applied), (Some(r), Some(a)) if r <= a) {
            debug!("Reconcile {:?} already applied on [{client}]", requested);
        } else {
            match self.store.get_service(resource_id).await {
                Ok(service) if service.is_active_eligible() => self.activate(&service).await?,
                Ok(service) => debug!("Skipping reconcile of {} in state {}", service.name, service.state),
                Err(e) if e.is_not_found() => debug!("Skipping reconcile of missing service {resource_id}"),
                Err(e) => return Err(e),
            }
        }

        if let Some(version) = requested {
            self.items.set_applied(&client, RECONCILE_ITEM, version).await?;
        }
        self.events.reply(update).await
    }

    /// Handles updates until the channel closes.
    ///
    /// Every `resync_interval_millis` the config items are resynced, so a
    /// request whose pass failed is sent again.
    pub async fn run_updates(&self, mut updates: mpsc::UnboundedReceiver<ConfigUpdate>) {
        let period = Duration::from_millis(self.config.resync_interval_millis);
        let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(update) = update else { break };
                    if let Err(e) = self.service_update(&update).await {
                        warn!("Failed to handle update {}: {e}", update.id);
                    }
                }
                _ = resync.tick() => match self.items.resync().await {
                    Ok(0) => {}
                    Ok(count) => debug!("Resynced config items of {count} client(s)"),
                    Err(e) => warn!("Failed to resync config items: {e}"),
                },
            }
        }
        debug!("Config update channel closed");
    }

    /// Waits until the service's latest reconcile request is applied.
    ///
    /// # Errors
    ///
    /// Returns a config item timeout if the request is still pending once
    /// the retry budget is spent.
    pub async fn wait_for_reconcile(&self, service: &Service) -> Result<()> {
        let client = Client::service(service.id);
        let version = self.items.get_requested_version(&client, RECONCILE_ITEM).await?;
        let request = ConfigUpdateRequest::new(client).with_item(ConfigUpdateItem::at_version(RECONCILE_ITEM, version));
        self.items.wait_for(&request).await
    }
}
