//! Error types for the orchestration engine.
//!
//! Remote task failures are not errors: they come back as a
//! [`TerminalResult`](crate::types::TerminalResult) with a `Failed` status.
//! The variants here cover everything that stops orbit from getting that far.

use orbit_core::{OperationKind, TargetRef, TaskId};
use serde::Serialize;
use thiserror::Error;

use crate::gate::DenyReason;
use crate::types::TaskStatus;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The target failed pre-submission validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A task of the same kind is already in flight for the target.
    #[error("a {kind} task is already in flight for {target}")]
    DuplicateInFlight {
        /// Operation kind.
        kind: OperationKind,
        /// Target that already has a running task.
        target: TargetRef,
    },

    /// The control plane could not be reached or answered unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    /// The control plane rejected the session token.
    #[error("control-plane session expired")]
    SessionExpired,

    /// The task cannot be resumed.
    #[error("task {task_id} is not retryable: {reason}")]
    NotRetryable {
        /// The task.
        task_id: TaskId,
        /// Why the resume was refused.
        reason: String,
    },

    /// The control plane does not know the task.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The run was cancelled.
    #[error("cancelled{}", describe_task(.task_id))]
    Cancelled {
        /// The task being monitored when cancellation was observed.
        task_id: Option<TaskId>,
    },

    /// A status change the lifecycle does not allow.
    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task.
        task_id: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] orbit_store::StoreError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] orbit_auth::AuthError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_task(task_id: &Option<TaskId>) -> String {
    task_id
        .as_ref()
        .map(|id| format!(" while monitoring task {id}"))
        .unwrap_or_default()
}

impl ControlError {
    /// Returns true if repeating the same call later might succeed.
    ///
    /// A token renewal that failed on the network or was rate limited counts
    /// as retriable; rejected credentials do not.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::SessionExpired => true,
            Self::Auth(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Why a target was removed from a run before submission.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationError {
    /// The control plane does not know the target.
    #[error("target {target} not found")]
    TargetNotFound {
        /// The target.
        target: TargetRef,
    },

    /// The operation would not change anything.
    #[error("target {target} is already in the desired state: {detail}")]
    AlreadyInDesiredState {
        /// The target.
        target: TargetRef,
        /// What is already in place.
        detail: String,
    },

    /// The compliance gate refused the transition.
    #[error("transition of {target} denied: {denial}")]
    ComplianceDenied {
        /// The target.
        target: TargetRef,
        /// Gate decision.
        denial: DenyReason,
    },

    /// A required parameter was not supplied.
    #[error("{kind} requires parameter `{name}`")]
    MissingParameter {
        /// Operation kind.
        kind: OperationKind,
        /// Parameter name.
        name: &'static str,
    },

    /// The control plane rejected the submission.
    #[error("rejected by control plane: {message}")]
    Rejected {
        /// Message returned by the control plane.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_auth::AuthError;

    #[test]
    fn retriable_errors() {
        assert!(ControlError::Transport("reset".into()).is_retriable());
        assert!(ControlError::SessionExpired.is_retriable());
        assert!(!ControlError::TaskNotFound(TaskId::new("t").unwrap()).is_retriable());
        assert!(!ControlError::Internal("bug".into()).is_retriable());
        assert!(!ControlError::DuplicateInFlight {
            kind: OperationKind::Transition,
            target: "wld/cl01".parse().unwrap(),
        }
        .is_retriable());
    }

    #[test]
    fn transient_auth_errors_are_retriable() {
        assert!(ControlError::Auth(AuthError::Request("HTTP 503".into())).is_retriable());
        assert!(ControlError::Auth(AuthError::RateLimited).is_retriable());
        assert!(!ControlError::Auth(AuthError::InvalidCredentials).is_retriable());
        assert!(!ControlError::Auth(AuthError::RefreshRejected).is_retriable());
    }

    #[test]
    fn cancelled_message_names_task() {
        let err = ControlError::Cancelled {
            task_id: Some(TaskId::new("task-7").unwrap()),
        };
        assert_eq!(err.to_string(), "cancelled while monitoring task task-7");
        assert_eq!(
            ControlError::Cancelled { task_id: None }.to_string(),
            "cancelled"
        );
    }

    #[test]
    fn validation_error_serializes_with_reason() {
        let err = ValidationError::ComplianceDenied {
            target: "wld/cl02".parse().unwrap(),
            denial: DenyReason::NoRecord,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["reason"], "compliance_denied");
        assert_eq!(json["target"], "wld/cl02");
        assert_eq!(json["denial"]["kind"], "no_record");
    }
}
