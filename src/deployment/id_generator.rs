//! Ordinal allocation for new deployment unit members.

use std::collections::{BTreeSet, HashMap};

/// Hands out the lowest free ordinal per launch config, starting at 1.
///
/// Built fresh on every pass from the ordinals of live instances, so no
/// counter is persisted and an ordinal still in use is never handed out.
#[derive(Debug, Clone, Default)]
pub struct DeploymentUnitInstanceIdGenerator {
    used: HashMap<String, BTreeSet<u32>>,
}

impl DeploymentUnitInstanceIdGenerator {
    /// Creates a generator from the ordinals in use per launch config.
    #[must_use]
    pub fn new(used: HashMap<String, BTreeSet<u32>>) -> Self {
        Self { used }
    }

    /// Records an ordinal as in use.
    pub fn mark_used(&mut self, launch_config: &str, id: u32) {
        self.used.entry(launch_config.to_string()).or_default().insert(id);
    }

    /// Returns the lowest free ordinal for a launch config and reserves it.
    pub fn next_available_id(&mut self, launch_config: &str) -> u32 {
        let used = self.used.entry(launch_config.to_string()).or_default();
        let mut candidate = 1;
        for id in used.iter() {
            match (*id).cmp(&candidate) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => candidate += 1,
                std::cmp::Ordering::Greater => break,
            }
        }
        used.insert(candidate);
        candidate
    }
}
