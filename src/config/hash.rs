//! Launch config hashing for change detection.
//!
//! Every instance records the hash of the launch config it was created
//! from; a unit whose members carry a stale hash no longer matches the
//! desired shape and is replaced.

use sha2::{Digest, Sha256};

use crate::labels::Labels;
use crate::state::LaunchConfig;

/// Hasher for computing launch config hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of a launch config.
    ///
    /// Label and environment entries are hashed in key order, so map
    /// iteration order never changes the result.
    #[must_use]
    pub fn hash_launch_config(&self, launch_config: &LaunchConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(launch_config.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(launch_config.image.as_bytes());
        hasher.update([0u8]);

        hash_sorted(&mut hasher, &launch_config.labels);
        hash_sorted(&mut hasher, &launch_config.environment);

        if let Some(check) = &launch_config.health_check {
            hasher.update([1u8]);
            if let Some(grace) = check.grace_period_secs {
                hasher.update(grace.to_be_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn hash_sorted(hasher: &mut Sha256, entries: &Labels) {
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([0xffu8]);
}
