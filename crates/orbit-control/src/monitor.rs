//! Task monitor.
//!
//! Polls one task to a terminal status, reporting progress after every
//! successful poll and flagging stalls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::client::{with_reauth, ControlPlaneClient};
use crate::clock::Clock;
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::progress::ProgressSink;
use crate::types::{OrchestratorConfig, ProgressEvent, StallEvent, TaskHandle, TerminalResult};

/// Polls tasks until they reach a terminal status.
pub struct TaskMonitor {
    client: Arc<dyn ControlPlaneClient>,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn ProgressSink>,
    poll_interval: Duration,
    stall_threshold: Duration,
}

/// Tracks the gap since the last successful poll.
struct StallTracker {
    last_success: Instant,
    reported: bool,
}

impl TaskMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        client: Arc<dyn ControlPlaneClient>,
        clock: Arc<dyn Clock>,
        progress: Arc<dyn ProgressSink>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            clock,
            progress,
            poll_interval: config.poll_interval(),
            stall_threshold: config.stall_threshold(),
        }
    }

    /// Poll `handle` until it is terminal.
    ///
    /// Transport errors are logged and polling continues. A rejected session
    /// is renewed once per poll.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires, `TaskNotFound` if the control
    /// plane forgets the task, `Auth` if the session cannot be renewed, and
    /// any other non-transport error unchanged.
    pub async fn poll(
        &self,
        handle: &mut TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<TerminalResult> {
        let started = self.clock.now();
        let mut stall = StallTracker {
            last_success: started,
            reported: false,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(Self::cancelled(handle));
            }

            let client = self.client.as_ref();
            let task_id = &handle.id;
            match with_reauth(client, move || client.get_task(task_id)).await {
                Ok(snapshot) => {
                    let now = self.clock.now();
                    self.observe_gap(handle, now, &mut stall);
                    stall.last_success = now;
                    stall.reported = false;

                    lifecycle::apply_refresh(handle, snapshot);
                    let elapsed = now.duration_since(started);

                    tracing::debug!(
                        task_id = %handle.id,
                        status = %handle.status,
                        completed = handle.completed_count(),
                        total = handle.total_count(),
                        "Polled task"
                    );
                    self.progress.on_progress(&ProgressEvent {
                        task_id: handle.id.clone(),
                        target: handle.target.clone(),
                        status: handle.status,
                        completed: handle.completed_count(),
                        total: handle.total_count(),
                        current_sub_step: handle.current_sub_step().map(str::to_string),
                        elapsed,
                    });

                    if handle.status.is_terminal() {
                        let result = TerminalResult::from_handle(handle, elapsed);
                        tracing::info!(
                            task_id = %result.task_id,
                            kind = %result.kind,
                            target_ref = %result.target,
                            status = %result.status,
                            failed_sub_step = result.failed_sub_step.as_deref().unwrap_or("-"),
                            elapsed_secs = elapsed.as_secs(),
                            "Task reached terminal status"
                        );
                        return Ok(result);
                    }
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(task_id = %handle.id, error = %e, "Poll failed, will retry");
                    self.observe_gap(handle, self.clock.now(), &mut stall);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Self::cancelled(handle)),
                () = self.clock.sleep(self.poll_interval) => {}
            }
        }
    }

    fn observe_gap(&self, handle: &TaskHandle, now: Instant, stall: &mut StallTracker) {
        let gap = now.duration_since(stall.last_success);
        if gap <= self.stall_threshold || stall.reported {
            return;
        }

        stall.reported = true;
        tracing::warn!(
            task_id = %handle.id,
            target_ref = %handle.target,
            gap_secs = gap.as_secs(),
            "No successful poll within stall threshold"
        );
        self.progress.on_stall(&StallEvent {
            task_id: handle.id.clone(),
            target: handle.target.clone(),
            since_last_success: gap,
        });
    }

    fn cancelled(handle: &TaskHandle) -> ControlError {
        tracing::info!(task_id = %handle.id, "Monitoring cancelled; remote task keeps running");
        ControlError::Cancelled {
            task_id: Some(handle.id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{Fault, MockControlPlane, ScriptedPoll};
    use crate::progress::RecordingProgress;
    use crate::types::{OperationParams, TaskStatus};
    use orbit_core::{OperationKind, TargetRef, TaskId};

    struct Fixture {
        clock: Arc<ManualClock>,
        mock: Arc<MockControlPlane>,
        progress: Arc<RecordingProgress>,
        monitor: TaskMonitor,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let mock = Arc::new(MockControlPlane::with_clock(clock.clone()));
        let progress = Arc::new(RecordingProgress::new());
        let monitor = TaskMonitor::new(
            mock.clone(),
            clock.clone(),
            progress.clone(),
            &OrchestratorConfig::default(),
        );
        Fixture {
            clock,
            mock,
            progress,
            monitor,
        }
    }

    fn target() -> TargetRef {
        "wld/cl01".parse().unwrap()
    }

    async fn submit(f: &Fixture, kind: OperationKind, polls: Vec<ScriptedPoll>) -> TaskHandle {
        f.mock.script(kind, &target(), polls);
        let id = f
            .mock
            .submit(kind, &target(), &OperationParams::default())
            .await
            .unwrap();
        TaskHandle::new(id, kind, target())
    }

    #[tokio::test]
    async fn reports_progress_until_success() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::ComplianceCheck,
            vec![
                ScriptedPoll::status(TaskStatus::InProgress)
                    .step("validate", TaskStatus::Successful)
                    .step("evaluate", TaskStatus::InProgress),
                ScriptedPoll::succeeded()
                    .step("validate", TaskStatus::Successful)
                    .step("evaluate", TaskStatus::Successful),
            ],
        )
        .await;

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Successful);
        assert!(result.elapsed >= Duration::from_secs(5));
        assert!(result.elapsed <= Duration::from_secs(10));

        let events = f.progress.events();
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].completed, events[0].total), (1, 2));
        assert_eq!(events[0].current_sub_step.as_deref(), Some("evaluate"));
        assert_eq!((events[1].completed, events[1].total), (2, 2));
        assert!(handle.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_is_a_result_not_an_error() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::ImageImport,
            vec![ScriptedPoll::failed("E42", "checksum mismatch")
                .step("download", TaskStatus::Successful)
                .step("verify", TaskStatus::Failed)],
        )
        .await;

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.failed_sub_step.as_deref(), Some("verify"));
        assert_eq!(result.last_error.unwrap().code, "E42");
    }

    #[tokio::test]
    async fn unrecognised_status_is_terminal_unknown() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::ImageImport,
            vec![ScriptedPoll::status(TaskStatus::from_remote("PAUSED"))],
        )
        .await;

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Unknown);
    }

    #[tokio::test]
    async fn stall_fires_once_per_gap() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::Transition,
            vec![
                ScriptedPoll::status(TaskStatus::InProgress),
                ScriptedPoll::status(TaskStatus::InProgress),
                ScriptedPoll::status(TaskStatus::InProgress),
                ScriptedPoll::succeeded(),
            ],
        )
        .await;

        // The first poll fails and the second hangs well past the threshold
        f.mock.inject(Fault::Transport("first".into()));
        f.mock.inject(Fault::Hang(Duration::from_secs(400)));

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Successful);
        let stalls = f.progress.stalls();
        assert_eq!(stalls.len(), 1);
        assert!(stalls[0].since_last_success > Duration::from_secs(300));
    }

    #[tokio::test]
    async fn long_error_streak_counts_as_one_stall() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::ComplianceCheck,
            vec![
                ScriptedPoll::status(TaskStatus::InProgress),
                ScriptedPoll::succeeded(),
            ],
        )
        .await;

        // Succeed once, then fail for 100 polls (500 s of virtual time)
        f.mock.inject(Fault::Hang(Duration::ZERO));
        for i in 0..100 {
            f.mock.inject(Fault::Transport(format!("timeout {i}")));
        }

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Successful);
        assert_eq!(f.progress.stalls().len(), 1);
        assert!(f.clock.elapsed() >= Duration::from_secs(500));
    }

    #[tokio::test]
    async fn transport_error_does_not_change_result() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::ImageImport,
            vec![
                ScriptedPoll::status(TaskStatus::InProgress),
                ScriptedPoll::succeeded(),
            ],
        )
        .await;
        f.mock.inject(Fault::Transport("reset".into()));

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Successful);
        assert_eq!(f.mock.get_task_calls(), 3);
        assert!(f.progress.stalls().is_empty());
    }

    #[tokio::test]
    async fn transient_token_renewal_failure_keeps_polling() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::ComplianceCheck,
            vec![
                ScriptedPoll::status(TaskStatus::InProgress),
                ScriptedPoll::succeeded(),
            ],
        )
        .await;
        f.mock.inject(Fault::TokenRenewal);

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Successful);
        assert_eq!(f.mock.get_task_calls(), 3);
        // Renewal errors are not session expiry
        assert_eq!(f.mock.reauth_count(), 0);
    }

    #[tokio::test]
    async fn session_expiry_reauthenticates_once() {
        let f = fixture();
        let mut handle = submit(&f, OperationKind::ImageImport, vec![ScriptedPoll::succeeded()]).await;
        f.mock.inject(Fault::SessionExpired);

        let result = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Successful);
        assert_eq!(f.mock.reauth_count(), 1);
        // The retried poll is immediate, not a new interval
        assert_eq!(f.clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn failed_reauthentication_is_fatal() {
        let f = fixture();
        let mut handle = submit(&f, OperationKind::ImageImport, vec![ScriptedPoll::succeeded()]).await;
        f.mock.inject(Fault::SessionExpired);
        f.mock.fail_reauthentication();

        let err = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Auth(_)));
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let f = fixture();
        let mut handle = TaskHandle::new(
            TaskId::new("never-issued").unwrap(),
            OperationKind::ImageImport,
            target(),
        );

        let err = f
            .monitor
            .poll(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn cancellation_leaves_task_running() {
        let f = fixture();
        let mut handle = submit(
            &f,
            OperationKind::Transition,
            vec![ScriptedPoll::status(TaskStatus::InProgress)],
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.monitor.poll(&mut handle, &cancel).await.unwrap_err();
        match err {
            ControlError::Cancelled { task_id } => assert_eq!(task_id, Some(handle.id.clone())),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(f.mock.task(&handle.id).unwrap().status, TaskStatus::Queued);
    }
}
