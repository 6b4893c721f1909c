//! Affinity constraints and their evaluation.
//!
//! A constraint is one parsed `(operator, key, value)` rule of a given kind.
//! Hard constraints shrink an [`AllocationCandidate`]; soft constraints pass
//! it through untouched and are left to host ranking.

use std::collections::BTreeSet;
use std::fmt;

use super::candidate::AllocationCandidate;
use crate::error::Result;
use crate::state::ObjectStore;

/// Affinity operator, in matching precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AffinityOp {
    /// Prefer not to co-locate.
    SoftNe,
    /// Must not co-locate.
    Ne,
    /// Prefer to co-locate.
    SoftEq,
    /// Must co-locate.
    Eq,
}

impl AffinityOp {
    /// Every operator, in the order they are tried when parsing.
    pub const ALL: [Self; 4] = [Self::SoftNe, Self::Ne, Self::SoftEq, Self::Eq];

    /// Symbol used inside environment keys (`constraint:region==west`).
    #[must_use]
    pub const fn env_symbol(self) -> &'static str {
        match self {
            Self::SoftNe => "!=~",
            Self::Ne => "!=",
            Self::SoftEq => "==~",
            Self::Eq => "==",
        }
    }

    /// Suffix used on label keys (`...:host_label_ne`).
    #[must_use]
    pub const fn label_symbol(self) -> &'static str {
        match self {
            Self::SoftNe => "_soft_ne",
            Self::Ne => "_ne",
            Self::SoftEq => "_soft",
            Self::Eq => "",
        }
    }

    /// Finds the operator whose label suffix is exactly `suffix`.
    #[must_use]
    pub fn from_label_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.label_symbol() == suffix)
    }

    /// Returns true for advisory operators.
    #[must_use]
    pub const fn is_soft(self) -> bool {
        matches!(self, Self::SoftNe | Self::SoftEq)
    }

    /// Returns true for co-location operators.
    #[must_use]
    pub const fn is_equal(self) -> bool {
        matches!(self, Self::SoftEq | Self::Eq)
    }
}

/// One parsed affinity rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDefinition {
    /// Operator.
    pub op: AffinityOp,
    /// Label key; required for label-keyed kinds.
    pub key: Option<String>,
    /// Label value or container name; never empty.
    pub value: String,
}

impl ConstraintDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new(op: AffinityOp, key: Option<&str>, value: &str) -> Self {
        Self {
            op,
            key: key.map(str::to_string),
            value: value.to_string(),
        }
    }
}

/// An executable placement rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Host must (not) carry label `key=value`.
    HostAffinity(ConstraintDefinition),
    /// Host must (not) run the container named `value`.
    ContainerAffinity(ConstraintDefinition),
    /// Host must (not) run a container carrying label `key=value`.
    ContainerLabelAffinity(ConstraintDefinition),
}

impl Constraint {
    /// The parsed rule.
    #[must_use]
    pub const fn definition(&self) -> &ConstraintDefinition {
        match self {
            Self::HostAffinity(def) | Self::ContainerAffinity(def) | Self::ContainerLabelAffinity(def) => def,
        }
    }

    /// Returns true for host-label rules.
    #[must_use]
    pub const fn is_host_affinity(&self) -> bool {
        matches!(self, Self::HostAffinity(_))
    }

    /// Returns true if the rule only biases ranking.
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        self.definition().op.is_soft()
    }

    /// Returns the candidate hosts that satisfy this rule.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails. Missing targets are not
    /// errors: they leave nothing to co-locate with.
    pub async fn filter(
        &self,
        store: &dyn ObjectStore,
        candidate: AllocationCandidate,
    ) -> Result<AllocationCandidate> {
        let def = self.definition();
        if def.op.is_soft() {
            return Ok(candidate);
        }

        match self {
            Self::HostAffinity(_) => {
                let key = def.key.as_deref().unwrap_or_default();
                let mut carrying = BTreeSet::new();
                for host_id in &candidate.hosts {
                    let host = store.get_host(*host_id).await?;
                    let has_label = host
                        .labels
                        .iter()
                        .any(|(k, v)| k.eq_ignore_ascii_case(key) && v.eq_ignore_ascii_case(&def.value));
                    if has_label {
                        carrying.insert(*host_id);
                    }
                }
                Ok(restrict(def.op, candidate, &carrying))
            }
            Self::ContainerAffinity(_) => {
                let targets = store
                    .find_instances_by_name(candidate.account_id, &def.value)
                    .await?;
                let running_on: BTreeSet<i64> = targets.iter().filter_map(|i| i.host_id).collect();
                Ok(restrict(def.op, candidate, &running_on))
            }
            Self::ContainerLabelAffinity(_) => {
                let key = def.key.as_deref().unwrap_or_default();
                let targets = store
                    .find_instances_with_label(candidate.account_id, key, &def.value)
                    .await?;
                let running_on: BTreeSet<i64> = targets
                    .iter()
                    .filter(|i| Some(i.id) != candidate.instance_id)
                    .filter_map(|i| i.host_id)
                    .collect();
                Ok(restrict(def.op, candidate, &running_on))
            }
        }
    }

    /// Returns true if every host in the candidate satisfies this rule.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn matches(&self, store: &dyn ObjectStore, candidate: &AllocationCandidate) -> Result<bool> {
        let before = candidate.hosts.len();
        let after = self.filter(store, candidate.clone()).await?;
        Ok(after.hosts.len() == before)
    }
}

fn restrict(op: AffinityOp, candidate: AllocationCandidate, hosts: &BTreeSet<i64>) -> AllocationCandidate {
    if op.is_equal() {
        candidate.retain(|h| hosts.contains(h))
    } else {
        candidate.retain(|h| !hosts.contains(h))
    }
}

impl fmt::Display for AffinityOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.env_symbol())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::HostAffinity(_) => "host_label",
            Self::ContainerAffinity(_) => "container",
            Self::ContainerLabelAffinity(_) => "container_label",
        };
        let def = self.definition();
        match &def.key {
            Some(key) => write!(f, "{kind} {key}{}{}", def.op, def.value),
            None => write!(f, "{kind} {}{}", def.op, def.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::state::{Host, HostState, Instance, MemoryStore};

    async fn store_with_hosts() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, region) in [(1, Some("west")), (2, None), (3, Some("east"))] {
            let mut labels = Labels::new();
            if let Some(region) = region {
                labels.insert(String::from("region"), region.to_string());
            }
            store
                .create_host(Host {
                    id,
                    account_id: 1,
                    name: format!("h{id}"),
                    state: HostState::Active,
                    labels,
                })
                .await
                .expect("create host");
        }
        store
    }

    #[test]
    fn test_label_suffix_lookup_is_exact() {
        assert_eq!(AffinityOp::from_label_suffix(""), Some(AffinityOp::Eq));
        assert_eq!(AffinityOp::from_label_suffix("_soft_ne"), Some(AffinityOp::SoftNe));
        assert_eq!(AffinityOp::from_label_suffix("_nope"), None);
    }

    #[tokio::test]
    async fn test_host_affinity_restricts_and_forbids() {
        let store = store_with_hosts().await;
        let candidate = AllocationCandidate::new(1, [1, 2, 3]);

        let eq = Constraint::HostAffinity(ConstraintDefinition::new(AffinityOp::Eq, Some("region"), "WEST"));
        let kept = eq.filter(&store, candidate.clone()).await.expect("filter");
        assert_eq!(kept.hosts.into_iter().collect::<Vec<_>>(), vec![1]);

        let ne = Constraint::HostAffinity(ConstraintDefinition::new(AffinityOp::Ne, Some("region"), "west"));
        let kept = ne.filter(&store, candidate).await.expect("filter");
        assert_eq!(kept.hosts.into_iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_soft_constraints_never_eliminate() {
        let store = store_with_hosts().await;
        let candidate = AllocationCandidate::new(1, [1, 2, 3]);
        let soft = Constraint::HostAffinity(ConstraintDefinition::new(AffinityOp::SoftEq, Some("region"), "west"));

        assert!(soft.matches(&store, &candidate).await.expect("matches"));
        assert_eq!(soft.filter(&store, candidate.clone()).await.expect("filter"), candidate);
    }

    #[tokio::test]
    async fn test_container_affinity_missing_target() {
        let store = store_with_hosts().await;
        let candidate = AllocationCandidate::new(1, [1, 2, 3]);

        let eq = Constraint::ContainerAffinity(ConstraintDefinition::new(AffinityOp::Eq, None, "db"));
        assert!(eq.filter(&store, candidate.clone()).await.expect("filter").is_empty());

        let ne = Constraint::ContainerAffinity(ConstraintDefinition::new(AffinityOp::Ne, None, "db"));
        assert_eq!(ne.filter(&store, candidate.clone()).await.expect("filter"), candidate);
    }

    #[tokio::test]
    async fn test_container_affinity_follows_target_host() {
        let store = store_with_hosts().await;
        let mut db = Instance::new(1, "db");
        db.host_id = Some(3);
        store.create_instance(db).await.expect("create instance");

        let candidate = AllocationCandidate::new(1, [1, 2, 3]);
        let ne = Constraint::ContainerAffinity(ConstraintDefinition::new(AffinityOp::Ne, None, "db"));
        let kept = ne.filter(&store, candidate).await.expect("filter");
        assert_eq!(kept.hosts.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_container_label_affinity_ignores_subject_instance() {
        let store = store_with_hosts().await;
        let mut me = Instance::new(1, "me");
        me.host_id = Some(1);
        me.labels.insert(String::from("tier"), String::from("web"));
        let me = store.create_instance(me).await.expect("create instance");

        let candidate = AllocationCandidate::new(1, [1, 2, 3]).for_instance(me.id);
        let ne = Constraint::ContainerLabelAffinity(ConstraintDefinition::new(AffinityOp::Ne, Some("tier"), "web"));

        assert!(ne.matches(&store, &candidate).await.expect("matches"));
    }

    #[test]
    fn test_display() {
        let c = Constraint::HostAffinity(ConstraintDefinition::new(AffinityOp::Ne, Some("region"), "west"));
        assert_eq!(c.to_string(), "host_label region!=west");
    }
}
