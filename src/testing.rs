//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ConfigHasher;
use crate::error::{AgentError, Result};
use crate::labels::{Labels, LABEL_SERVICE_DEPLOYMENT_UNIT, LABEL_SERVICE_HASH, PRIMARY_LAUNCH_CONFIG_NAME};
use crate::runtime::{AgentReply, RuntimeAgent};
use crate::state::{
    ExposeMapDao, HealthState, Host, HostState, Instance, InstanceState, LaunchConfig, ObjectStore, Service,
    ServiceState,
};

/// Active service in stack `foo` with a single primary `nginx` launch config.
pub fn service_fixture(id: i64, name: &str) -> Service {
    Service {
        id,
        account_id: 1,
        environment_id: 1,
        stack_name: String::from("foo"),
        name: name.to_string(),
        state: ServiceState::Active,
        scale: 1,
        labels: Labels::new(),
        launch_configs: vec![LaunchConfig {
            name: String::from(PRIMARY_LAUNCH_CONFIG_NAME),
            image: String::from("nginx"),
            labels: Labels::new(),
            environment: Labels::new(),
            health_check: None,
        }],
        sidekick_service_ids: Vec::new(),
        removed: None,
    }
}

/// Active host in account 1.
pub fn host_fixture(id: i64, labels: &[(&str, &str)]) -> Host {
    Host {
        id,
        account_id: 1,
        name: format!("host-{id}"),
        state: HostState::Active,
        labels: labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    }
}

/// A running member of `unit` built the way a reconciliation pass builds it.
pub fn unit_member(service: &Service, launch_config: &str, index: u32, unit: &str) -> Instance {
    let mut instance = Instance::new(service.account_id, service.instance_name(launch_config, index));
    instance.labels = service.system_labels(launch_config);
    instance
        .labels
        .insert(LABEL_SERVICE_DEPLOYMENT_UNIT.to_string(), unit.to_string());
    if let Some(lc) = service.launch_config(launch_config) {
        instance
            .labels
            .insert(LABEL_SERVICE_HASH.to_string(), ConfigHasher::new().hash_launch_config(lc));
        instance.health_state = lc.health_check.as_ref().map(|_| HealthState::Healthy);
    }
    instance.service_index = Some(index);
    instance.state = InstanceState::Running;
    instance.host_id = Some(1);
    instance.started_at = Some(Utc::now());
    instance
}

/// Stores an instance and binds it to its service.
pub async fn seed_member(store: &std::sync::Arc<dyn ObjectStore>, service: &Service, instance: Instance) -> Instance {
    let dao = ExposeMapDao::new(std::sync::Arc::clone(store));
    let (instance, _) = dao
        .create_service_instance(service, instance)
        .await
        .expect("seed member");
    instance
}

/// Agent that records every call and tracks how many run at once.
#[derive(Debug, Default)]
pub struct RecordingAgent {
    events: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl RecordingAgent {
    /// Agent whose start calls take `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Calls seen so far, as `op:instance-name`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }

    /// Most calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str, instance: &Instance) {
        self.events
            .lock()
            .expect("events")
            .push(format!("{op}:{}", instance.name));
    }
}

#[async_trait]
impl RuntimeAgent for RecordingAgent {
    async fn start(&self, instance: &Instance, candidate_hosts: &BTreeSet<i64>) -> Result<AgentReply> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.record("start", instance);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let host_id = candidate_hosts
            .first()
            .copied()
            .ok_or(AgentError::NoEligibleHost {
                instance_id: instance.id,
            })?;
        Ok(AgentReply {
            host_id,
            health_state: instance.health_state,
        })
    }

    async fn wait_for_start(&self, instance: &Instance, _timeout: Duration) -> Result<AgentReply> {
        self.record("wait", instance);
        Ok(AgentReply {
            host_id: instance.host_id.unwrap_or(1),
            health_state: instance.health_state,
        })
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        self.record("stop", instance);
        Ok(())
    }

    async fn remove(&self, instance: &Instance) -> Result<()> {
        self.record("remove", instance);
        Ok(())
    }
}
