//! Task status state machine.
//!
//! This module defines the valid status transitions for a tracked task and
//! applies control-plane refreshes to a [`TaskHandle`] without ever moving it
//! backwards.
//!
//! # State Machine
//!
//! ```text
//!        ┌──────────┐
//!        │  Queued  │──────────────────────────┐
//!        └────┬─────┘                          │
//!             │                                │
//!             ▼                                ▼
//!     ┌──────────────┐  (resume)   ┌──────────────────────────┐
//!     │  InProgress  │◄────────────│ Failed                   │
//!     └──────┬───────┘             └──────────────────────────┘
//!            │                      ▲
//!            ├──────────────────────┘
//!            ├────────────▶ Successful
//!            └────────────▶ Unknown
//! ```
//!
//! `Successful` and `Unknown` are final. `Failed` only leaves through an
//! explicit resume.

use chrono::Utc;
use orbit_core::TaskId;

use crate::error::{ControlError, Result};
use crate::types::{TaskHandle, TaskSnapshot, TaskStatus};

/// Validates a status transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(
    task_id: &TaskId,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<TaskStatus> {
    if from == to || is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidTransition {
            task_id: task_id.clone(),
            from,
            to,
        })
    }
}

/// Check if a status transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{Failed, InProgress, Queued, Successful, Unknown};

    matches!(
        (from, to),
        (Queued, InProgress)
            | (Queued | InProgress, Successful | Failed | Unknown)
            // Resume
            | (Failed, InProgress)
    )
}

/// Returns true if the transition is only reachable through a resume call.
#[must_use]
pub const fn is_resume(from: TaskStatus, to: TaskStatus) -> bool {
    matches!((from, to), (TaskStatus::Failed, TaskStatus::InProgress))
}

/// Decide which status a refresh leaves the handle in.
///
/// Polls never downgrade: a terminal status stays put, and `Queued` reported
/// after `InProgress` keeps `InProgress`.
#[must_use]
pub const fn resolve_refresh(current: TaskStatus, reported: TaskStatus) -> TaskStatus {
    if is_valid_transition(current, reported) && !is_resume(current, reported) {
        reported
    } else {
        current
    }
}

/// Apply a fetched snapshot to a handle.
///
/// Returns true if the handle's status changed.
pub fn apply_refresh(handle: &mut TaskHandle, snapshot: TaskSnapshot) -> bool {
    let previous = handle.status;
    let next = resolve_refresh(previous, snapshot.status);

    if next != snapshot.status {
        tracing::debug!(
            task_id = %handle.id,
            current = %previous,
            reported = %snapshot.status,
            "Ignoring status regression from control plane"
        );
    }

    // A frozen terminal handle keeps the sub-steps it finished with
    if !(previous.is_terminal() && next == previous && snapshot.status != previous) {
        handle.sub_steps = snapshot.sub_steps;
    }

    handle.status = next;
    if next.is_terminal() {
        handle.completed_at = snapshot
            .completed_at
            .or(handle.completed_at)
            .or_else(|| Some(Utc::now()));
    } else {
        handle.completed_at = None;
    }

    if next == TaskStatus::Failed {
        if snapshot.last_error.is_some() {
            handle.last_error = snapshot.last_error;
        }
    } else {
        handle.last_error = None;
    }

    next != previous
}

/// Move a failed handle back to `InProgress` after a successful resume call.
///
/// # Errors
///
/// Returns `ControlError::InvalidTransition` unless the handle is `Failed`.
pub fn resume(handle: &mut TaskHandle) -> Result<()> {
    if !is_resume(handle.status, TaskStatus::InProgress) {
        return Err(ControlError::InvalidTransition {
            task_id: handle.id.clone(),
            from: handle.status,
            to: TaskStatus::InProgress,
        });
    }

    handle.status = validate_transition(&handle.id, handle.status, TaskStatus::InProgress)?;
    handle.completed_at = None;
    handle.last_error = None;
    Ok(())
}
