//! Resume of failed tasks.
//!
//! A retry never submits a new operation: it asks the control plane to resume
//! the existing task id from its last completed sub-step, then monitors it.

use std::sync::Arc;

use orbit_core::TaskId;
use tokio_util::sync::CancellationToken;

use crate::client::{with_reauth, ControlPlaneClient};
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::monitor::TaskMonitor;
use crate::types::{TaskHandle, TaskStatus, TerminalResult};

/// Resumes failed tasks and monitors them to completion.
pub struct RetryCoordinator {
    client: Arc<dyn ControlPlaneClient>,
    monitor: Arc<TaskMonitor>,
}

impl RetryCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(client: Arc<dyn ControlPlaneClient>, monitor: Arc<TaskMonitor>) -> Self {
        Self { client, monitor }
    }

    /// Resume `task_id` and poll it to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns `NotRetryable` unless the task is `Failed` and the control
    /// plane accepts the resume, `Transport` if it cannot be reached, and any
    /// error from [`TaskMonitor::poll`].
    pub async fn retry(
        &self,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> Result<TerminalResult> {
        let client = self.client.as_ref();
        let snapshot = with_reauth(client, move || client.get_task(task_id)).await?;

        let reason = match snapshot.status {
            TaskStatus::Failed => None,
            TaskStatus::Successful => Some("already succeeded"),
            TaskStatus::Queued | TaskStatus::InProgress => Some("still running"),
            TaskStatus::Unknown => Some("status unknown"),
        };
        if let Some(reason) = reason {
            return Err(ControlError::NotRetryable {
                task_id: task_id.clone(),
                reason: reason.to_string(),
            });
        }

        if cancel.is_cancelled() {
            return Err(ControlError::Cancelled {
                task_id: Some(task_id.clone()),
            });
        }

        let mut handle = TaskHandle::from_snapshot(snapshot);
        let resumed = with_reauth(client, move || client.resume_task(task_id)).await?;
        if resumed != handle.id {
            tracing::debug!(task_id = %handle.id, resumed_id = %resumed, "Control plane re-keyed resumed task");
            handle.id = resumed;
        }

        lifecycle::resume(&mut handle)?;
        tracing::info!(
            task_id = %handle.id,
            kind = %handle.kind,
            target_ref = %handle.target,
            "Resumed task"
        );

        self.monitor.poll(&mut handle, cancel).await
    }
}
