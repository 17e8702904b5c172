//! Error types for the HwameiStor node engine
//!
//! Provides structured error types for all engine components including
//! command execution, disk inventory, pools, replicas, DRBD HA and the
//! admission webhook.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the node engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource conflict: {kind}/{name}")]
    ResourceConflict { kind: String, name: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Replica already exists for volume {volume}")]
    ReplicaExists { volume: String },

    #[error("Replica not found for volume {volume}")]
    ReplicaNotFound { volume: String },

    #[error("Pool not found: {pool}")]
    PoolNotFound { pool: String },

    #[error("Insufficient resources in pool {pool}: {reason}")]
    InsufficientResources { pool: String, reason: String },

    #[error("Request of {requested} bytes exceeds limit {limit} of pool {pool}")]
    OverLimit {
        pool: String,
        requested: i64,
        limit: i64,
    },

    #[error("{operation} is not supported for {kind} volumes")]
    Unsupported { kind: String, operation: String },

    // =========================================================================
    // Command Errors
    // =========================================================================
    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Failed to spawn command {command}: {reason}")]
    CommandSpawn { command: String, reason: String },

    #[error("Command failed with exit code {exit_code}: {command}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Unexpected output from {command}: {reason}")]
    CommandOutputParse { command: String, reason: String },

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    // =========================================================================
    // HA / Encryption Errors
    // =========================================================================
    #[error("DRBD metadata corrupted for resource {resource}")]
    HaMetadataCorrupted { resource: String },

    #[error("DRBD resource {resource}: {reason}")]
    HaResource { resource: String, reason: String },

    #[error("Encryption failed for volume {volume}: {reason}")]
    Encryption { volume: String, reason: String },

    // =========================================================================
    // Webhook Errors
    // =========================================================================
    #[error("Admission error: {0}")]
    Admission(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::ResourceConflict { .. }
            | Error::CommandTimeout { .. }
            | Error::CommandSpawn { .. }
            | Error::CommandFailed { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Resource issues - medium retry
            Error::InsufficientResources { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Operator attention required - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidSpec(_)
            | Error::PoolNotFound { .. }
            | Error::OverLimit { .. }
            | Error::Unsupported { .. }
            | Error::ResourceNotFound { .. }
            | Error::HaMetadataCorrupted { .. }
            | Error::CapacityParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::ResourceConflict { .. }
                | Error::CommandTimeout { .. }
                | Error::CommandSpawn { .. }
        )
    }

    /// Whether the error means the object is gone from the store
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::InsufficientResources {
            pool: "LocalStorage_PoolHDD".into(),
            reason: "no free volume".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::HaMetadataCorrupted {
            resource: "pvc-1".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::CommandFailed {
            command: "lvs".into(),
            exit_code: 5,
            stderr: "boom".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::CommandTimeout {
            command: "drbdadm adjust pvc-1".into(),
            timeout_secs: 30,
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_not_found() {
        let err = Error::ResourceNotFound {
            kind: "LocalVolumeReplica".into(),
            name: "pvc-1-abcde".into(),
        };
        assert!(err.is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }
}
