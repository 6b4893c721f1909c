//! Error types for the corral placement and reconciliation core.
//!
//! This module provides the error hierarchy for every stage of a placement
//! decision or reconciliation pass: configuration, object storage, locking,
//! remote agents, process scheduling, config-item distribution and the
//! deployment controller itself.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for corral.
#[derive(Debug, Error)]
pub enum CorralError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Object store errors.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lock acquisition errors.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Remote agent errors.
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Process scheduling errors.
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Config-item distribution errors.
    #[error("Config item error: {0}")]
    ConfigItem(#[from] ConfigItemError),

    /// Deployment controller errors.
    #[error("Deployment error: {0}")]
    Deployment(#[from] DeploymentError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The inventory file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The inventory file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// An environment override could not be parsed.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// Raw value that failed to parse.
        value: String,
    },
}

/// Object store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced record does not exist.
    #[error("{resource_type} {id} not found")]
    NotFound {
        /// Type of the missing record.
        resource_type: String,
        /// Id of the missing record.
        id: i64,
    },

    /// The snapshot on disk is unreadable.
    #[error("Snapshot is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("Snapshot serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Writing the snapshot failed.
    #[error("Failed to persist snapshot: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },
}

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be acquired within the wait budget.
    #[error("Timed out after {waited_secs}s waiting for lock on {resource}")]
    Timeout {
        /// Lock resource description.
        resource: String,
        /// Seconds waited.
        waited_secs: u64,
    },
}

/// Remote agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent rejected or failed the request.
    #[error("Agent failed to {operation} instance {instance_id}: {message}")]
    OperationFailed {
        /// Operation name (start, stop, remove, wait).
        operation: String,
        /// Target instance.
        instance_id: i64,
        /// Agent message.
        message: String,
    },

    /// No host survived hard-constraint filtering.
    #[error("No eligible host for instance {instance_id}")]
    NoEligibleHost {
        /// Instance being placed.
        instance_id: i64,
    },

    /// The instance did not report started within the budget.
    #[error("Timeout waiting for instance {instance_id} to start")]
    StartTimeout {
        /// Instance waited on.
        instance_id: i64,
    },
}

/// Process scheduling errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The resource already has a process running.
    #[error("{resource} is already transitioning")]
    AlreadyTransitioning {
        /// Resource description.
        resource: String,
    },

    /// The process refused the resource's current state.
    #[error("Process {process} cancelled for {resource}: {reason}")]
    Cancelled {
        /// Process name.
        process: String,
        /// Resource description.
        resource: String,
        /// Why the process refused.
        reason: String,
    },

    /// Any other scheduling failure.
    #[error("Failed to schedule {process} for {resource}: {message}")]
    Failed {
        /// Process name.
        process: String,
        /// Resource description.
        resource: String,
        /// Failure description.
        message: String,
    },
}

/// Config-item distribution errors.
#[derive(Debug, Error)]
pub enum ConfigItemError {
    /// Items were still pending after the retry budget ran out.
    #[error("Timeout waiting for {client} to apply item(s) {pending:?}")]
    Timeout {
        /// Client the items belong to.
        client: String,
        /// Names of the items still pending.
        pending: Vec<String>,
    },

    /// The trigger channel was closed.
    #[error("Config update channel closed")]
    ChannelClosed,
}

/// Deployment controller errors.
#[derive(Debug, Error)]
pub enum DeploymentError {
    /// A unit operation failed.
    #[error("Failed to {operation} deployment unit {unit}: {reason}")]
    UnitFailed {
        /// Operation name.
        operation: String,
        /// Unit uuid.
        unit: String,
        /// Reason for failure.
        reason: String,
    },

    /// Scheduling a service transition failed fatally.
    #[error("Activation aborted for service {service_id}: {reason}")]
    Aborted {
        /// Service being activated.
        service_id: i64,
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for corral operations.
pub type Result<T> = std::result::Result<T, CorralError>;

impl CorralError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Lock(LockError::Timeout { .. })
                | Self::Process(ProcessError::AlreadyTransitioning { .. })
                | Self::Agent(AgentError::StartTimeout { .. })
                | Self::ConfigItem(ConfigItemError::Timeout { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Lock(LockError::Timeout { .. }) => Some(2),
            Self::Process(ProcessError::AlreadyTransitioning { .. }) => Some(1),
            Self::Agent(AgentError::StartTimeout { .. })
            | Self::ConfigItem(ConfigItemError::Timeout { .. }) => Some(5),
            _ => None,
        }
    }

    /// Returns true if this error means a looked-up record is missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: i64) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id,
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl AgentError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(operation: &str, instance_id: i64, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            instance_id,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = CorralError::Process(ProcessError::AlreadyTransitioning {
            resource: String::from("service 1"),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(1));

        let err = CorralError::internal("boom");
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_timeout_carries_pending_items() {
        let err = ConfigItemError::Timeout {
            client: String::from("service:4"),
            pending: vec![String::from("reconcile")],
        };
        assert!(err.to_string().contains("reconcile"));
    }
}
