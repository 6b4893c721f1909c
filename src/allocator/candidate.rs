//! Placement candidates.

use std::collections::BTreeSet;

/// The hosts still under consideration for one placement decision.
///
/// Constraints take a candidate by value and return the survivors, so a
/// candidate never grows while it moves through a filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationCandidate {
    /// Account whose containers the constraints look at.
    pub account_id: i64,
    /// Instance being placed, excluded from its own label lookups.
    pub instance_id: Option<i64>,
    /// Remaining host ids.
    pub hosts: BTreeSet<i64>,
}

impl AllocationCandidate {
    /// Creates a candidate over the given hosts.
    #[must_use]
    pub fn new(account_id: i64, hosts: impl IntoIterator<Item = i64>) -> Self {
        Self {
            account_id,
            instance_id: None,
            hosts: hosts.into_iter().collect(),
        }
    }

    /// Creates a candidate with a single host.
    #[must_use]
    pub fn single(account_id: i64, host_id: i64) -> Self {
        Self::new(account_id, [host_id])
    }

    /// Sets the instance being placed.
    #[must_use]
    pub const fn for_instance(mut self, instance_id: i64) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Keeps only the hosts for which `keep` returns true.
    #[must_use]
    pub fn retain(mut self, keep: impl FnMut(&i64) -> bool) -> Self {
        self.hosts.retain(keep);
        self
    }

    /// Returns true if no host is left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
