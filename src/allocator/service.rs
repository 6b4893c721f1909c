//! Host eligibility queries and label normalization.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::candidate::AllocationCandidate;
use super::constraint::Constraint;
use super::extract::{extract_constraints_from_env, extract_constraints_from_labels};
use crate::error::Result;
use crate::labels::{
    Labels, LABEL_HEADER_AFFINITY_CONTAINER_LABEL, LABEL_PROJECT_SERVICE_NAME, LABEL_SERVICE_LAUNCH_CONFIG,
    LABEL_STACK_NAME, LABEL_STACK_SERVICE_NAME, PRIMARY_LAUNCH_CONFIG_NAME,
};
use crate::state::{Instance, ObjectStore};

/// Answers placement questions against the object store.
#[derive(Clone)]
pub struct AllocatorService {
    store: Arc<dyn ObjectStore>,
}

impl AllocatorService {
    /// Creates an allocator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Active hosts of the account that satisfy every host-label rule in
    /// `label_constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn get_hosts_satisfying_host_affinity(
        &self,
        account_id: i64,
        label_constraints: &Labels,
    ) -> Result<Vec<i64>> {
        let constraints = host_affinity_constraints(label_constraints);

        let mut acceptable = Vec::new();
        for host in self.store.active_hosts(account_id).await? {
            if self.host_satisfies(account_id, host.id, &constraints).await? {
                acceptable.push(host.id);
            }
        }
        Ok(acceptable)
    }

    /// Returns true if the host satisfies every host-label rule in
    /// `label_constraints`.
    ///
    /// Only detects a host that now satisfies the rules. A host that stops
    /// satisfying them is not reported, so this must not drive removals.
    ///
    /// # Errors
    ///
    /// Returns an error if the host does not exist or a lookup fails.
    pub async fn host_changes_affects_host_affinity_rules(
        &self,
        host_id: i64,
        label_constraints: &Labels,
    ) -> Result<bool> {
        let host = self.store.get_host(host_id).await?;
        let constraints = host_affinity_constraints(label_constraints);
        self.host_satisfies(host.account_id, host_id, &constraints).await
    }

    async fn host_satisfies(&self, account_id: i64, host_id: i64, constraints: &[Constraint]) -> Result<bool> {
        for constraint in constraints {
            let candidate = AllocationCandidate::single(account_id, host_id);
            if !constraint.matches(self.store.as_ref(), &candidate).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rewrites container-label affinity values that name a service into the
    /// canonical `stack/service[/launch-config]` form.
    ///
    /// A bare service name gets the stack prepended only if a service by
    /// that name exists in the environment. A secondary launch config name
    /// is appended when the reference is a prefix of this launch config's
    /// own `stack/service/launch-config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service names cannot be listed.
    pub async fn normalize_labels(
        &self,
        environment_id: i64,
        system_labels: &Labels,
        service_user_labels: &mut Labels,
    ) -> Result<()> {
        let stack_name = system_labels.get(LABEL_STACK_NAME);
        let own_name = system_labels.get(LABEL_STACK_SERVICE_NAME);
        let launch_config = system_labels.get(LABEL_SERVICE_LAUNCH_CONFIG);

        let services_in_stack: HashSet<String> = self
            .store
            .service_names_in_environment(environment_id)
            .await?
            .into_iter()
            .collect();

        for (key, value) in service_user_labels.iter_mut() {
            if !key.starts_with(LABEL_HEADER_AFFINITY_CONTAINER_LABEL) {
                continue;
            }
            let Some(mut referenced) = referenced_service(value) else {
                continue;
            };

            if !referenced.contains('/') && own_name.is_some() && services_in_stack.contains(&referenced) {
                if let Some(stack_name) = stack_name {
                    referenced = format!("{stack_name}/{referenced}");
                }
            }

            if let (Some(own_name), Some(launch_config)) = (own_name, launch_config) {
                if launch_config != PRIMARY_LAUNCH_CONFIG_NAME && own_name.starts_with(&referenced) {
                    referenced = format!("{referenced}/{launch_config}");
                }
            }

            debug!("Normalized {key}: {value} -> {referenced}");
            *value = format!("{LABEL_STACK_SERVICE_NAME}={referenced}");
        }
        Ok(())
    }

    /// Hosts that pass every hard constraint of the instance's labels and
    /// environment, out of the account's active hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn eligible_hosts(&self, instance: &Instance) -> Result<BTreeSet<i64>> {
        let mut constraints = extract_constraints_from_labels(&instance.labels, Some(instance));
        constraints.extend(extract_constraints_from_env(&instance.environment));

        let hosts = self.store.active_hosts(instance.account_id).await?;
        let mut candidate = AllocationCandidate::new(instance.account_id, hosts.iter().map(|h| h.id));
        if instance.id != 0 {
            candidate = candidate.for_instance(instance.id);
        }

        for constraint in &constraints {
            let before = candidate.hosts.len();
            candidate = constraint.filter(self.store.as_ref(), candidate).await?;
            debug!(
                instance = %instance.name,
                constraint = %constraint,
                before,
                after = candidate.hosts.len(),
                "applied constraint"
            );
        }

        if candidate.is_empty() {
            warn!(
                instance = %instance.name,
                constraints = constraints.len(),
                "no host satisfies hard constraints"
            );
        }
        Ok(candidate.hosts)
    }
}

fn host_affinity_constraints(label_constraints: &Labels) -> Vec<Constraint> {
    extract_constraints_from_labels(label_constraints, None)
        .into_iter()
        .filter(Constraint::is_host_affinity)
        .collect()
}

fn referenced_service(value: &str) -> Option<String> {
    [LABEL_STACK_SERVICE_NAME, LABEL_PROJECT_SERVICE_NAME]
        .iter()
        .find_map(|prefix| value.strip_prefix(prefix))
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Host, HostState, MemoryStore};
    use crate::testing::service_fixture;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    async fn allocator() -> (AllocatorService, Arc<dyn ObjectStore>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        store
            .create_host(Host {
                id: 1,
                account_id: 1,
                name: String::from("h1"),
                state: HostState::Active,
                labels: labels(&[("region", "west")]),
            })
            .await
            .expect("create host");
        store
            .create_host(Host {
                id: 2,
                account_id: 1,
                name: String::from("h2"),
                state: HostState::Active,
                labels: Labels::new(),
            })
            .await
            .expect("create host");
        store
            .create_service(service_fixture(10, "bar"))
            .await
            .expect("create service");
        (AllocatorService::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_host_affinity_anti_filter() {
        let (allocator, _store) = allocator().await;
        let hosts = allocator
            .get_hosts_satisfying_host_affinity(
                1,
                &labels(&[("io.rancher.scheduler.affinity:host_label_ne", "region=west")]),
            )
            .await
            .expect("query");
        assert_eq!(hosts, vec![2]);
    }

    #[tokio::test]
    async fn test_non_host_rules_are_ignored_for_host_affinity() {
        let (allocator, _store) = allocator().await;
        let hosts = allocator
            .get_hosts_satisfying_host_affinity(1, &labels(&[("io.rancher.scheduler.affinity:container", "missing")]))
            .await
            .expect("query");
        assert_eq!(hosts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_host_change_only_reports_newly_satisfying_hosts() {
        let (allocator, _store) = allocator().await;
        let rules = labels(&[("io.rancher.scheduler.affinity:host_label", "region=west")]);
        assert!(allocator
            .host_changes_affects_host_affinity_rules(1, &rules)
            .await
            .expect("query"));
        assert!(!allocator
            .host_changes_affects_host_affinity_rules(2, &rules)
            .await
            .expect("query"));
    }

    #[tokio::test]
    async fn test_normalize_bare_service_name() {
        let (allocator, _store) = allocator().await;
        let system = labels(&[
            (LABEL_STACK_NAME, "foo"),
            (LABEL_STACK_SERVICE_NAME, "foo/bar"),
            (LABEL_SERVICE_LAUNCH_CONFIG, PRIMARY_LAUNCH_CONFIG_NAME),
        ]);
        let key = "io.rancher.scheduler.affinity:container_label";
        let mut user = labels(&[(key, "io.rancher.stack_service.name=bar"), ("owner", "bar")]);

        allocator.normalize_labels(1, &system, &mut user).await.expect("normalize");

        assert_eq!(user[key], "io.rancher.stack_service.name=foo/bar");
        assert_eq!(user["owner"], "bar");
    }

    #[tokio::test]
    async fn test_normalize_appends_secondary_launch_config() {
        let (allocator, _store) = allocator().await;
        let system = labels(&[
            (LABEL_STACK_NAME, "foo"),
            (LABEL_STACK_SERVICE_NAME, "foo/bar/worker"),
            (LABEL_SERVICE_LAUNCH_CONFIG, "worker"),
        ]);
        let key = "io.rancher.scheduler.affinity:container_label_ne";
        let mut user = labels(&[(key, "io.rancher.project_service.name=bar")]);

        allocator.normalize_labels(1, &system, &mut user).await.expect("normalize");

        assert_eq!(user[key], "io.rancher.stack_service.name=foo/bar/worker");
    }

    #[tokio::test]
    async fn test_normalize_leaves_unknown_service_unqualified() {
        let (allocator, _store) = allocator().await;
        let system = labels(&[
            (LABEL_STACK_NAME, "foo"),
            (LABEL_STACK_SERVICE_NAME, "foo/bar"),
            (LABEL_SERVICE_LAUNCH_CONFIG, PRIMARY_LAUNCH_CONFIG_NAME),
        ]);
        let key = "io.rancher.scheduler.affinity:container_label";
        let mut user = labels(&[(key, "io.rancher.stack_service.name=other")]);

        allocator.normalize_labels(1, &system, &mut user).await.expect("normalize");

        assert_eq!(user[key], "io.rancher.stack_service.name=other");
    }

    #[tokio::test]
    async fn test_eligible_hosts_combines_labels_and_env() {
        let (allocator, _store) = allocator().await;
        let mut instance = Instance::new(1, "foo_bar_1");
        instance.labels = labels(&[("io.rancher.scheduler.affinity:host_label_soft_ne", "region=west")]);
        instance.environment = labels(&[("constraint:region==west", "")]);

        let hosts = allocator.eligible_hosts(&instance).await.expect("eligible");
        assert_eq!(hosts.into_iter().collect::<Vec<_>>(), vec![1]);
    }
}
