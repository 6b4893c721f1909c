//! Service lifecycle process scheduling.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::error::ProcessError;
use crate::state::{ObjectStore, ServiceState};

/// Lifecycle processes a service can go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProcess {
    /// Inactive to active.
    Activate,
    /// Re-apply an active or inactive service.
    Update,
    /// Active to inactive.
    Deactivate,
    /// Anything to removed.
    Remove,
}

impl ServiceProcess {
    /// Target state when the process may run from `from`.
    #[must_use]
    pub const fn transition(self, from: ServiceState) -> Option<ServiceState> {
        use ServiceState::{Active, Inactive, Removed, Requested};
        match (self, from) {
            (Self::Activate, Requested | Inactive) => Some(Active),
            (Self::Update, Active) => Some(Active),
            (Self::Update, Inactive) => Some(Inactive),
            (Self::Deactivate, Active) => Some(Inactive),
            (Self::Remove, Requested | Inactive | Active) => Some(Removed),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Activate => "service.activate",
            Self::Update => "service.update",
            Self::Deactivate => "service.deactivate",
            Self::Remove => "service.remove",
        };
        write!(f, "{name}")
    }
}

/// Trait for process schedulers.
///
/// Scheduling is fire-and-forget: callers do not wait for the process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessScheduler: Send + Sync {
    /// Schedules `process` on a service.
    ///
    /// Fails with [`ProcessError::AlreadyTransitioning`] if another process
    /// owns the service and [`ProcessError::Cancelled`] if the process does
    /// not apply to the service's state.
    async fn schedule(&self, process: ServiceProcess, service_id: i64) -> std::result::Result<(), ProcessError>;
}

/// Scheduler that runs each process to completion on the spot.
#[derive(Clone)]
pub struct InlineProcessScheduler {
    store: Arc<dyn ObjectStore>,
}

impl InlineProcessScheduler {
    /// Creates a scheduler over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProcessScheduler for InlineProcessScheduler {
    async fn schedule(&self, process: ServiceProcess, service_id: i64) -> std::result::Result<(), ProcessError> {
        let resource = format!("service {service_id}");
        let failed = |message: String| ProcessError::Failed {
            process: process.to_string(),
            resource: format!("service {service_id}"),
            message,
        };

        let mut service = self
            .store
            .get_service(service_id)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if service.state.is_transitioning() {
            return Err(ProcessError::AlreadyTransitioning { resource });
        }

        let Some(target) = process.transition(service.state) else {
            return Err(ProcessError::Cancelled {
                process: process.to_string(),
                resource,
                reason: format!("not valid from state {}", service.state),
            });
        };

        info!("{process} on {resource}: {} -> {target}", service.state);

        service.state = target;
        if target == ServiceState::Removed {
            service.removed = Some(Utc::now());
        }
        self.store
            .update_service(&service)
            .await
            .map_err(|e| failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::testing::service_fixture;

    async fn scheduler(state: ServiceState) -> (InlineProcessScheduler, Arc<dyn ObjectStore>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let mut service = service_fixture(1, "web");
        service.state = state;
        store.create_service(service).await.expect("create service");
        (InlineProcessScheduler::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_activate_inactive_service() {
        let (scheduler, store) = scheduler(ServiceState::Inactive).await;
        scheduler
            .schedule(ServiceProcess::Activate, 1)
            .await
            .expect("activate");
        assert_eq!(store.get_service(1).await.expect("service").state, ServiceState::Active);
    }

    #[tokio::test]
    async fn test_transitioning_service_is_rejected() {
        let (scheduler, _store) = scheduler(ServiceState::Activating).await;
        let err = scheduler
            .schedule(ServiceProcess::Update, 1)
            .await
            .expect_err("should reject");
        assert!(matches!(err, ProcessError::AlreadyTransitioning { .. }));
    }

    #[tokio::test]
    async fn test_invalid_transition_is_cancelled() {
        let (scheduler, _store) = scheduler(ServiceState::Inactive).await;
        let err = scheduler
            .schedule(ServiceProcess::Deactivate, 1)
            .await
            .expect_err("should cancel");
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_remove_sets_timestamp() {
        let (scheduler, store) = scheduler(ServiceState::Active).await;
        scheduler.schedule(ServiceProcess::Remove, 1).await.expect("remove");
        let service = store.get_service(1).await.expect("service");
        assert_eq!(service.state, ServiceState::Removed);
        assert!(service.removed.is_some());
    }

    #[tokio::test]
    async fn test_missing_service_fails() {
        let (scheduler, _store) = scheduler(ServiceState::Active).await;
        let err = scheduler
            .schedule(ServiceProcess::Activate, 99)
            .await
            .expect_err("missing");
        assert!(matches!(err, ProcessError::Failed { .. }));
    }
}
