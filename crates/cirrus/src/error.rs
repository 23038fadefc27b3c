// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the cirrus engine.
//!
//! Every failure mode has a stable machine-readable code (see [`Error::code`])
//! and a structured payload. Render-phase errors abort the current render
//! before any provider call is made; provider errors abort the running batch
//! but keep already-applied outputs and the reached checkpoint; backend
//! retries are internal and only surface here once exhausted.

use crate::machine::DeploymentStatus;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type providers report through their contract.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for the cirrus engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Hooks were called in a different order across renders of one fiber.
    #[error("hook order violated at '{path}': slot {slot} was {previous}, now {current}")]
    HookOrderViolated {
        /// Path of the fiber whose hook sequence changed.
        path: String,
        /// Zero-based hook slot index at which the mismatch was detected.
        slot: usize,
        /// Hook kind recorded at this slot on the previous render.
        previous: &'static str,
        /// Hook kind observed at this slot on the current render.
        current: &'static str,
    },

    /// Two fibers declared the same node id from incompatible paths.
    #[error("duplicate node id '{id}': declared from '{first_path}' and '{second_path}'")]
    DuplicateNodeId {
        /// The colliding node id.
        id: String,
        /// Fiber path that declared the node first.
        first_path: String,
        /// Fiber path that collided with it.
        second_path: String,
    },

    /// The deployment dependency graph contains a cycle.
    #[error("dependency cycle between nodes: {}", paths.join(" -> "))]
    CycleInDependencies {
        /// Paths of the nodes participating in the cycle.
        paths: Vec<String>,
    },

    /// A reactive flush re-scheduled the same computation past its cap.
    #[error("reactive flush cycle: a computation re-ran more than {limit} times in one flush")]
    CycleDetected {
        /// Per-flush re-run cap that was exceeded.
        limit: usize,
    },

    /// The convergence loop hit its iteration cap. Non-fatal: the driver
    /// completes the deployment with whatever converged and records a
    /// diagnostic, but surfaces this when asked to treat it as an error.
    #[error("convergence did not reach a fixed point within {max_iterations} iterations")]
    MaxIterationsExceeded {
        /// The configured iteration cap.
        max_iterations: usize,
    },

    /// Required props missing, or a context was read without a provider.
    #[error("validation failed: {reason}")]
    ValidationFailed {
        /// Human-readable description of what was invalid.
        reason: String,
    },

    /// An illegal deployment state machine move was attempted.
    #[error("invalid deployment state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// Status the stack was in.
        from: DeploymentStatus,
        /// Status the caller tried to move to.
        to: DeploymentStatus,
    },

    /// The deployment lock for the stack is held by someone else.
    #[error("could not acquire deployment lock for stack '{stack}' (held by {holder})")]
    LockAcquisitionFailed {
        /// Stack whose lock was contested.
        stack: String,
        /// Holder id reported by the backend, or "unknown".
        holder: String,
    },

    /// The deployment lock could not be renewed mid-deployment.
    #[error("deployment lock for stack '{stack}' was lost: {reason}")]
    LockLost {
        /// Stack whose lock was lost.
        stack: String,
        /// Why renewal failed.
        reason: String,
    },

    /// The provider failed to apply a node.
    #[error("provider failed to apply node '{node_id}': {source}")]
    ProviderApplyFailed {
        /// Id of the node whose apply failed.
        node_id: String,
        /// Underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// The provider failed to destroy a node.
    #[error("provider failed to destroy node '{node_id}': {source}")]
    ProviderDestroyFailed {
        /// Id of the node whose destroy failed.
        node_id: String,
        /// Underlying provider error.
        #[source]
        source: ProviderError,
    },

    /// A state backend operation kept failing after retries exhausted.
    #[error("state backend operation '{operation}' failed after {attempts} attempt(s): {source}")]
    BackendOperationFailed {
        /// Logical backend operation name (e.g. "save_state").
        operation: &'static str,
        /// Number of attempts made, including the first.
        attempts: usize,
        /// The last backend error observed.
        #[source]
        source: BackendError,
    },

    /// The whole-run async budget or a per-operation timeout elapsed.
    #[error("deployment of stack '{stack}' timed out after {elapsed_ms}ms")]
    DeploymentTimeout {
        /// Stack whose deployment timed out.
        stack: String,
        /// Milliseconds elapsed when the budget ran out.
        elapsed_ms: u64,
    },
}

impl Error {
    /// Stable machine-readable code for this error kind.
    ///
    /// Codes never change across releases; match on these rather than on
    /// display strings.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HookOrderViolated { .. } => "HOOK_ORDER_VIOLATED",
            Self::DuplicateNodeId { .. } => "DUPLICATE_NODE_ID",
            Self::CycleInDependencies { .. } => "CYCLE_IN_DEPENDENCIES",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::MaxIterationsExceeded { .. } => "MAX_ITERATIONS_EXCEEDED",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::LockAcquisitionFailed { .. } => "LOCK_ACQUISITION_FAILED",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::ProviderApplyFailed { .. } => "PROVIDER_APPLY_FAILED",
            Self::ProviderDestroyFailed { .. } => "PROVIDER_DESTROY_FAILED",
            Self::BackendOperationFailed { .. } => "BACKEND_OPERATION_FAILED",
            Self::DeploymentTimeout { .. } => "DEPLOYMENT_TIMEOUT",
        }
    }
}

/// Storage-level failures reported by [`StateBackend`](crate::backend::StateBackend)
/// implementations. These are retried by the engine according to its
/// [`RetryPolicy`](crate::retry::RetryPolicy) and wrapped in
/// [`Error::BackendOperationFailed`] once retries exhaust.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The state document could not be serialized.
    #[error("serialization failed: {reason}")]
    SerializationFailed {
        /// Serializer diagnostic.
        reason: String,
    },

    /// The state document could not be deserialized.
    #[error("deserialization failed: {reason}")]
    DeserializationFailed {
        /// Deserializer diagnostic.
        reason: String,
    },

    /// A persisted state file failed its integrity check (corruption).
    #[error("integrity check failed for stack '{stack}': {reason}")]
    IntegrityCheckFailed {
        /// Stack whose state file is corrupt.
        stack: String,
        /// Which header field mismatched.
        reason: String,
    },

    /// A cross-process lock on backend storage could not be taken.
    #[error("backend lock failed: {reason}")]
    LockFailed {
        /// Lock diagnostic.
        reason: String,
    },

    /// Anything else the backend wants to report.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = Error::ValidationFailed {
            reason: "x".into(),
        };
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let err = Error::LockLost {
            stack: "prod".into(),
            reason: "renewal refused".into(),
        };
        assert_eq!(err.code(), "LOCK_LOST");
    }

    #[test]
    fn backend_error_wraps_into_engine_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::BackendOperationFailed {
            operation: "get_state",
            attempts: 3,
            source: BackendError::Io(io),
        };
        assert_eq!(err.code(), "BACKEND_OPERATION_FAILED");
        assert!(err.to_string().contains("get_state"));
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn cycle_error_lists_paths() {
        let err = Error::CycleInDependencies {
            paths: vec!["app/db".into(), "app/cache".into()],
        };
        assert!(err.to_string().contains("app/db -> app/cache"));
    }
}
