//! Batch coordination.
//!
//! Fans one operation kind out over many targets. Serial mode validates,
//! submits, and polls one target at a time, consulting a [`FailurePolicy`]
//! when a task fails. Parallel mode validates and submits every target
//! concurrently and returns without polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use orbit_core::{OperationKind, TargetRef, TaskId};
use tokio_util::sync::CancellationToken;

use crate::client::{with_reauth, ControlPlaneClient};
use crate::error::{ControlError, Result, ValidationError};
use crate::gate::{ComplianceGate, DenyReason, GateDecision};
use crate::monitor::TaskMonitor;
use crate::retry::RetryCoordinator;
use crate::types::{
    OperationParams, OrchestratorConfig, PerTargetOutcome, TargetOutcome, TaskHandle, TaskStatus,
    TerminalResult,
};

/// What to do after a target's task fails in a serial batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Resume the failed task.
    Retry,
    /// Record the failure and move on to the next target.
    Skip,
    /// Record the failure and mark every remaining target aborted.
    Abort,
}

/// Context handed to a [`FailurePolicy`].
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    /// Operation kind of the batch.
    pub kind: OperationKind,
    /// Target whose task failed.
    pub target: &'a TargetRef,
    /// The failed result.
    pub result: &'a TerminalResult,
    /// Resumes already attempted for this target.
    pub attempts: u32,
}

/// Decides how a serial batch reacts to a failed task.
pub trait FailurePolicy: Send + Sync {
    /// Choose the reaction to a failure.
    fn decide(&self, ctx: &FailureContext<'_>) -> FailureDecision;
}

/// Policy for unattended runs.
///
/// Continues past failed imports and compliance checks. Aborts on a failed
/// transition, since the remaining targets' gate state can no longer be
/// trusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnattendedPolicy;

impl FailurePolicy for UnattendedPolicy {
    fn decide(&self, ctx: &FailureContext<'_>) -> FailureDecision {
        match ctx.kind {
            OperationKind::Transition => FailureDecision::Abort,
            OperationKind::ImageImport | OperationKind::ComplianceCheck => FailureDecision::Skip,
        }
    }
}

/// Policy that always makes the same decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub FailureDecision);

impl FailurePolicy for FixedPolicy {
    fn decide(&self, _ctx: &FailureContext<'_>) -> FailureDecision {
        self.0
    }
}

/// Runs one operation kind over many targets.
pub struct BatchCoordinator {
    client: Arc<dyn ControlPlaneClient>,
    gate: Arc<ComplianceGate>,
    monitor: Arc<TaskMonitor>,
    retry: Arc<RetryCoordinator>,
    max_retry_attempts: u32,
    max_parallel_submissions: usize,
}

impl BatchCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        client: Arc<dyn ControlPlaneClient>,
        gate: Arc<ComplianceGate>,
        monitor: Arc<TaskMonitor>,
        retry: Arc<RetryCoordinator>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            gate,
            monitor,
            retry,
            max_retry_attempts: config.max_retry_attempts,
            max_parallel_submissions: config.max_parallel_submissions.max(1),
        }
    }

    /// Check that `target` may receive `kind`, returning the parameters to
    /// submit with.
    ///
    /// For a transition the gate's image replaces any requested image.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the target is rejected, and transport or store
    /// errors unchanged.
    pub async fn validate(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<OperationParams> {
        let client = self.client.as_ref();
        let state = with_reauth(client, move || client.get_target(target)).await?;
        if state.is_none() {
            return Err(ValidationError::TargetNotFound {
                target: target.clone(),
            }
            .into());
        }

        match kind {
            OperationKind::ComplianceCheck => Ok(params.clone()),
            OperationKind::ImageImport => {
                let Some(image) = params.image.as_ref() else {
                    return Err(ValidationError::MissingParameter { kind, name: "image" }.into());
                };
                if with_reauth(client, move || client.image_exists(image)).await? {
                    return Err(ValidationError::AlreadyInDesiredState {
                        target: target.clone(),
                        detail: format!("image {image} is already imported"),
                    }
                    .into());
                }
                Ok(params.clone())
            }
            OperationKind::Transition => match self.gate.check(target).await? {
                GateDecision::Allow { image } => {
                    if params.image.as_ref().is_some_and(|requested| *requested != image) {
                        tracing::debug!(target_ref = %target, image = %image, "Using compliance-gated image for transition");
                    }
                    Ok(OperationParams {
                        image: Some(image),
                        ..params.clone()
                    })
                }
                GateDecision::Deny(DenyReason::TargetAlreadyTransitioned { image }) => {
                    Err(ValidationError::AlreadyInDesiredState {
                        target: target.clone(),
                        detail: format!("target already runs image {image}"),
                    }
                    .into())
                }
                GateDecision::Deny(denial) => Err(ValidationError::ComplianceDenied {
                    target: target.clone(),
                    denial,
                }
                .into()),
            },
        }
    }

    /// Validate and submit one target.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `DuplicateInFlight`, and transport errors.
    pub async fn submit(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<TaskId> {
        let params = self.validate(kind, target, params).await?;

        let client = self.client.as_ref();
        let params_ref = &params;
        let task_id =
            with_reauth(client, move || client.submit(kind, target, params_ref)).await?;

        tracing::info!(
            task_id = %task_id,
            kind = %kind,
            target_ref = %target,
            "Submitted operation"
        );
        Ok(task_id)
    }

    /// Validate, submit, and poll one target to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Self::submit`] or [`TaskMonitor::poll`].
    pub async fn execute(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
        cancel: &CancellationToken,
    ) -> Result<TerminalResult> {
        let task_id = self.submit(kind, target, params).await?;
        self.monitor_issued(task_id, kind, target, cancel).await
    }

    /// Resume a failed task and poll it to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns any error from [`RetryCoordinator::retry`].
    pub async fn resume(
        &self,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> Result<TerminalResult> {
        let result = self.retry.retry(task_id, cancel).await?;
        self.after_terminal(&result).await;
        Ok(result)
    }

    /// Run targets one after another, in input order.
    ///
    /// Target N+1 is not submitted until target N is terminal. An error that
    /// would hit every remaining target the same way (rejected credentials, a
    /// store failure) halts the batch: the failing target is reported
    /// `Halted` and the rest `Aborted`.
    pub async fn run_serial(
        &self,
        kind: OperationKind,
        targets: &[TargetRef],
        params: &OperationParams,
        policy: &dyn FailurePolicy,
        cancel: &CancellationToken,
    ) -> Vec<PerTargetOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        let mut aborted = false;

        for target in targets {
            let outcome = if aborted {
                TargetOutcome::Aborted
            } else if cancel.is_cancelled() {
                TargetOutcome::Cancelled { task_id: None }
            } else {
                let (outcome, abort) = self.run_one(kind, target, params, policy, cancel).await;
                if abort {
                    tracing::warn!(
                        kind = %kind,
                        target_ref = %target,
                        remaining = targets.len() - outcomes.len() - 1,
                        "Aborting remaining targets"
                    );
                    aborted = true;
                }
                outcome
            };

            outcomes.push(PerTargetOutcome {
                target: target.clone(),
                outcome,
            });
        }

        outcomes
    }

    /// Validate and submit every target without polling.
    ///
    /// Submissions run concurrently, bounded by the configured limit. Results
    /// come back in input order. After a halting error, targets not yet
    /// started are reported `Aborted`; ids already issued are kept.
    pub async fn run_parallel(
        &self,
        kind: OperationKind,
        targets: &[TargetRef],
        params: &OperationParams,
        cancel: &CancellationToken,
    ) -> Vec<PerTargetOutcome> {
        let halted = AtomicBool::new(false);
        let submissions: Vec<_> = targets
            .iter()
            .map(|target| self.submit_detached(kind, target, params, cancel, &halted))
            .collect();

        stream::iter(submissions)
            .buffered(self.max_parallel_submissions)
            .collect()
            .await
    }

    async fn submit_detached(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
        cancel: &CancellationToken,
        halted: &AtomicBool,
    ) -> PerTargetOutcome {
        let outcome = if halted.load(Ordering::Acquire) {
            TargetOutcome::Aborted
        } else if cancel.is_cancelled() {
            TargetOutcome::Cancelled { task_id: None }
        } else {
            match self.submit(kind, target, params).await {
                Ok(task_id) => TargetOutcome::Submitted(task_id),
                Err(e) => {
                    let (outcome, halt) = classify(target, e, None);
                    if halt {
                        halted.store(true, Ordering::Release);
                    }
                    outcome
                }
            }
        };

        PerTargetOutcome {
            target: target.clone(),
            outcome,
        }
    }

    /// Poll an issued task to a terminal status.
    async fn monitor_issued(
        &self,
        task_id: TaskId,
        kind: OperationKind,
        target: &TargetRef,
        cancel: &CancellationToken,
    ) -> Result<TerminalResult> {
        let mut handle = TaskHandle::new(task_id, kind, target.clone());
        let result = self.monitor.poll(&mut handle, cancel).await?;
        self.after_terminal(&result).await;
        Ok(result)
    }

    /// Run one target of a serial batch. The flag is true if the batch must
    /// abort.
    async fn run_one(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
        policy: &dyn FailurePolicy,
        cancel: &CancellationToken,
    ) -> (TargetOutcome, bool) {
        let task_id = match self.submit(kind, target, params).await {
            Ok(task_id) => task_id,
            Err(e) => return classify(target, e, None),
        };
        let mut result = match self
            .monitor_issued(task_id.clone(), kind, target, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => return classify(target, e, Some(task_id)),
        };

        let mut attempts = 0;
        loop {
            if result.is_success() {
                return (TargetOutcome::Completed(result), false);
            }
            if attempts > 0 && attempts >= self.max_retry_attempts {
                return (TargetOutcome::RetryLimitExceeded(result), false);
            }

            let decision = policy.decide(&FailureContext {
                kind,
                target,
                result: &result,
                attempts,
            });

            match decision {
                FailureDecision::Abort => return (TargetOutcome::Completed(result), true),
                FailureDecision::Skip => return (TargetOutcome::Completed(result), false),
                FailureDecision::Retry if result.status != TaskStatus::Failed => {
                    tracing::debug!(
                        task_id = %result.task_id,
                        status = %result.status,
                        "Not retrying task without a resumable failure"
                    );
                    return (TargetOutcome::Completed(result), false);
                }
                FailureDecision::Retry if attempts >= self.max_retry_attempts => {
                    return (TargetOutcome::RetryLimitExceeded(result), false);
                }
                FailureDecision::Retry => {
                    attempts += 1;
                    tracing::info!(
                        task_id = %result.task_id,
                        target_ref = %target,
                        attempt = attempts,
                        max_attempts = self.max_retry_attempts,
                        "Retrying failed task"
                    );
                    result = match self.resume(&result.task_id, cancel).await {
                        Ok(resumed) => resumed,
                        Err(e) => return classify(target, e, Some(result.task_id.clone())),
                    };
                }
            }
        }
    }

    /// Side effects of a terminal result: a successful compliance check is
    /// written through to the snapshot cache.
    async fn after_terminal(&self, result: &TerminalResult) {
        if result.kind != OperationKind::ComplianceCheck || !result.is_success() {
            return;
        }

        if let Err(e) = self
            .gate
            .record_evaluation(&result.target, Some(&result.task_id))
            .await
        {
            tracing::warn!(
                task_id = %result.task_id,
                target_ref = %result.target,
                error = %e,
                "Failed to record compliance evaluation"
            );
        }
    }
}

/// Turn a per-target error into an outcome. The flag is true for errors that
/// would hit every remaining target the same way.
fn classify(
    target: &TargetRef,
    error: ControlError,
    task_id: Option<TaskId>,
) -> (TargetOutcome, bool) {
    let (outcome, halt) = match error {
        ControlError::Validation(v) => (TargetOutcome::Rejected(v), false),
        ControlError::DuplicateInFlight { .. } => (TargetOutcome::Duplicate, false),
        ControlError::Cancelled { task_id: monitored } => (
            TargetOutcome::Cancelled {
                task_id: task_id.or(monitored),
            },
            false,
        ),
        e if e.is_retriable() => (
            TargetOutcome::Errored {
                error: e.to_string(),
                task_id,
            },
            false,
        ),
        e @ (ControlError::Auth(_) | ControlError::Store(_)) => (
            TargetOutcome::Halted {
                error: e.to_string(),
                task_id,
            },
            true,
        ),
        e => (
            TargetOutcome::Errored {
                error: e.to_string(),
                task_id,
            },
            false,
        ),
    };

    if halt {
        tracing::warn!(target_ref = %target, outcome = ?outcome, "Batch halted");
    } else {
        tracing::debug!(target_ref = %target, outcome = ?outcome, "Target did not complete");
    }
    (outcome, halt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{MockControlPlane, ScriptedPoll};
    use crate::progress::{ProgressSink, RecordingProgress};
    use crate::types::ProgressEvent;
    use crate::types::ComplianceReport;
    use chrono::Utc;
    use orbit_core::ImageRef;
    use orbit_store::{ComplianceStatus, RocksStore, Store};
    use tempfile::TempDir;

    struct Fixture {
        mock: Arc<MockControlPlane>,
        store: Arc<RocksStore>,
        batch: BatchCoordinator,
        _dir: TempDir,
    }

    fn fixture_with(config: OrchestratorConfig) -> Fixture {
        fixture_reporting(config, Arc::new(RecordingProgress::new()))
    }

    fn fixture_reporting(config: OrchestratorConfig, progress: Arc<dyn ProgressSink>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new());
        let mock = Arc::new(MockControlPlane::with_clock(clock.clone()));
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let monitor = Arc::new(TaskMonitor::new(mock.clone(), clock, progress, &config));
        let gate = Arc::new(ComplianceGate::new(mock.clone(), store.clone(), None));
        let retry = Arc::new(RetryCoordinator::new(mock.clone(), monitor.clone()));
        let batch = BatchCoordinator::new(mock.clone(), gate, monitor, retry, &config);
        Fixture {
            mock,
            store,
            batch,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(OrchestratorConfig::default())
    }

    fn target(s: &str) -> TargetRef {
        s.parse().unwrap()
    }

    fn image(s: &str) -> ImageRef {
        ImageRef::new(s).unwrap()
    }

    fn targets(f: &Fixture, names: &[&str]) -> Vec<TargetRef> {
        names
            .iter()
            .map(|n| {
                let t = target(n);
                f.mock.add_target(&t, Some(image("img-7")));
                t
            })
            .collect()
    }

    fn put_record(f: &Fixture, t: &TargetRef, img: &str) {
        f.store
            .put_record(&orbit_store::ComplianceRecord {
                target: t.clone(),
                image: image(img),
                status: ComplianceStatus::NonCompliant,
                evaluated_at: Utc::now(),
                task_id: None,
            })
            .unwrap();
    }

    fn submitted_targets(f: &Fixture) -> Vec<String> {
        f.mock
            .submissions()
            .iter()
            .map(|s| s.target.to_string())
            .collect()
    }

    #[tokio::test]
    async fn serial_runs_in_order() {
        let f = fixture();
        let ts = targets(&f, &["wld/a", "wld/b", "wld/c"]);

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(submitted_targets(&f), vec!["wld/a", "wld/b", "wld/c"]);
        assert!(outcomes
            .iter()
            .all(|o| matches!(&o.outcome, TargetOutcome::Completed(r) if r.is_success())));
    }

    #[tokio::test]
    async fn unattended_continues_past_failed_check() {
        let f = fixture();
        let ts = targets(&f, &["wld/a", "wld/b", "wld/c"]);
        f.mock.script(
            OperationKind::ComplianceCheck,
            &ts[1],
            vec![ScriptedPoll::failed("E1", "collector offline")],
        );

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(f.mock.submissions().len(), 3);
        match &outcomes[1].outcome {
            TargetOutcome::Completed(r) => assert_eq!(r.status, TaskStatus::Failed),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(&outcomes[2].outcome, TargetOutcome::Completed(r) if r.is_success()));
    }

    #[tokio::test]
    async fn abort_stops_remaining_targets() {
        let f = fixture();
        let ts = targets(&f, &["wld/a", "wld/b", "wld/c"]);
        for t in &ts {
            put_record(&f, t, "img-8");
        }
        f.mock.add_image(image("img-8"));
        f.mock.script(
            OperationKind::Transition,
            &ts[1],
            vec![ScriptedPoll::failed("E9", "host unreachable")],
        );

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::Transition,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(submitted_targets(&f), vec!["wld/a", "wld/b"]);
        assert!(matches!(&outcomes[0].outcome, TargetOutcome::Completed(r) if r.is_success()));
        assert!(matches!(&outcomes[1].outcome, TargetOutcome::Completed(r) if r.status == TaskStatus::Failed));
        assert_eq!(outcomes[2].outcome, TargetOutcome::Aborted);
    }

    #[tokio::test]
    async fn transition_without_record_is_rejected_before_submission() {
        let f = fixture();
        let ts = targets(&f, &["wld/cl02"]);

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::Transition,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert!(f.mock.submissions().is_empty());
        assert_eq!(
            outcomes[0].outcome,
            TargetOutcome::Rejected(ValidationError::ComplianceDenied {
                target: ts[0].clone(),
                denial: DenyReason::NoRecord,
            })
        );
    }

    #[tokio::test]
    async fn transition_uses_gated_image() {
        let f = fixture();
        let ts = targets(&f, &["wld/cl01"]);
        put_record(&f, &ts[0], "img-8");
        f.mock.add_image(image("img-8"));

        let result = f
            .batch
            .execute(
                OperationKind::Transition,
                &ts[0],
                &OperationParams::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(f.mock.submissions()[0].params.image, Some(image("img-8")));
    }

    #[tokio::test]
    async fn validation_rejects_per_target() {
        let f = fixture();
        let mut ts = targets(&f, &["wld/a"]);
        ts.push(target("wld/ghost"));
        f.mock.add_image(image("img-8"));

        // Importing an image that already exists changes nothing
        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ImageImport,
                &ts,
                &OperationParams::with_image(image("img-8")),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcomes[0].outcome,
            TargetOutcome::Rejected(ValidationError::AlreadyInDesiredState { .. })
        ));
        assert!(matches!(
            outcomes[1].outcome,
            TargetOutcome::Rejected(ValidationError::TargetNotFound { .. })
        ));
        assert!(f.mock.submissions().is_empty());
    }

    #[tokio::test]
    async fn retry_is_bounded() {
        let f = fixture_with(OrchestratorConfig {
            max_retry_attempts: 2,
            ..OrchestratorConfig::default()
        });
        let ts = targets(&f, &["wld/a"]);
        f.mock.script(
            OperationKind::ImageImport,
            &ts[0],
            vec![ScriptedPoll::failed("E1", "mirror down")],
        );
        for _ in 0..5 {
            f.mock.script_resume(
                OperationKind::ImageImport,
                &ts[0],
                vec![ScriptedPoll::failed("E1", "mirror down")],
            );
        }

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ImageImport,
                &ts,
                &OperationParams::with_image(image("img-9")),
                &FixedPolicy(FailureDecision::Retry),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(f.mock.resumes().len(), 2);
        assert_eq!(f.mock.submissions().len(), 1);
        assert!(matches!(
            &outcomes[0].outcome,
            TargetOutcome::RetryLimitExceeded(r) if r.status == TaskStatus::Failed
        ));
    }

    #[tokio::test]
    async fn retry_recovers_on_resume() {
        let f = fixture();
        let ts = targets(&f, &["wld/a"]);
        f.mock.script(
            OperationKind::ComplianceCheck,
            &ts[0],
            vec![ScriptedPoll::failed("E1", "collector offline")],
        );
        f.mock.set_compliance(
            &ts[0],
            ComplianceReport {
                image: image("img-8"),
                status: ComplianceStatus::NonCompliant,
                evaluated_at: Utc::now(),
            },
        );

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &FixedPolicy(FailureDecision::Retry),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(&outcomes[0].outcome, TargetOutcome::Completed(r) if r.is_success()));
        assert_eq!(f.mock.resumes().len(), 1);
        // The resumed evaluation is written through
        assert!(f.store.latest_record(&ts[0]).unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_is_never_retried() {
        let f = fixture();
        let ts = targets(&f, &["wld/a"]);
        f.mock.script(
            OperationKind::ComplianceCheck,
            &ts[0],
            vec![ScriptedPoll::status(TaskStatus::Unknown)],
        );

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &FixedPolicy(FailureDecision::Retry),
                &CancellationToken::new(),
            )
            .await;

        assert!(f.mock.resumes().is_empty());
        assert!(matches!(&outcomes[0].outcome, TargetOutcome::Completed(r) if r.status == TaskStatus::Unknown));
    }

    #[tokio::test]
    async fn duplicate_and_transport_failures_are_per_target() {
        let f = fixture();
        let ts = targets(&f, &["wld/a", "wld/b", "wld/c"]);
        // A task already in flight for `a`, and a network failure for `b`
        f.mock
            .submit(OperationKind::ComplianceCheck, &ts[0], &OperationParams::default())
            .await
            .unwrap();
        f.mock.fail_next_submit(&ts[1]);

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes[0].outcome, TargetOutcome::Duplicate);
        assert!(matches!(
            outcomes[1].outcome,
            TargetOutcome::Errored { task_id: None, .. }
        ));
        assert!(matches!(&outcomes[2].outcome, TargetOutcome::Completed(r) if r.is_success()));
    }

    #[tokio::test]
    async fn session_expiry_on_submit_is_healed() {
        let f = fixture();
        let ts = targets(&f, &["wld/a"]);
        f.mock.expire_next_submit(&ts[0]);

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(f.mock.reauth_count(), 1);
        assert!(matches!(&outcomes[0].outcome, TargetOutcome::Completed(r) if r.is_success()));
    }

    #[tokio::test]
    async fn cancelled_batch_submits_nothing_more() {
        let f = fixture();
        let ts = targets(&f, &["wld/a", "wld/b"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &cancel,
            )
            .await;

        assert!(f.mock.submissions().is_empty());
        assert!(outcomes
            .iter()
            .all(|o| o.outcome == TargetOutcome::Cancelled { task_id: None }));
    }

    /// Cancels the batch as soon as the first progress event arrives.
    struct CancelOnProgress(CancellationToken);

    impl ProgressSink for CancelOnProgress {
        fn on_progress(&self, _event: &ProgressEvent) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn cancel_mid_poll_keeps_issued_task_id() {
        let cancel = CancellationToken::new();
        let f = fixture_reporting(
            OrchestratorConfig::default(),
            Arc::new(CancelOnProgress(cancel.clone())),
        );
        let ts = targets(&f, &["wld/a", "wld/b"]);
        f.mock.script(
            OperationKind::ComplianceCheck,
            &ts[0],
            vec![ScriptedPoll::status(TaskStatus::InProgress)],
        );

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &cancel,
            )
            .await;

        let issued = f.mock.submissions()[0].task_id.clone();
        assert_eq!(
            outcomes[0].outcome,
            TargetOutcome::Cancelled {
                task_id: Some(issued.clone())
            }
        );
        assert_eq!(outcomes[0].outcome.task_id(), Some(&issued));
        assert_eq!(outcomes[1].outcome, TargetOutcome::Cancelled { task_id: None });
        assert_eq!(f.mock.submissions().len(), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_halt_serial_batch() {
        let f = fixture();
        let ts = targets(&f, &["wld/a", "wld/b", "wld/c"]);
        f.mock.expire_next_submit(&ts[1]);
        f.mock.fail_reauthentication();

        let outcomes = f
            .batch
            .run_serial(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &UnattendedPolicy,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(&outcomes[0].outcome, TargetOutcome::Completed(r) if r.is_success()));
        assert!(matches!(
            outcomes[1].outcome,
            TargetOutcome::Halted { task_id: None, .. }
        ));
        assert_eq!(outcomes[2].outcome, TargetOutcome::Aborted);
        assert_eq!(submitted_targets(&f), vec!["wld/a"]);
    }

    #[tokio::test]
    async fn rejected_credentials_keep_issued_parallel_ids() {
        let f = fixture_with(OrchestratorConfig {
            max_parallel_submissions: 1,
            ..OrchestratorConfig::default()
        });
        let ts = targets(&f, &["wld/a", "wld/b", "wld/c"]);
        f.mock.expire_next_submit(&ts[1]);
        f.mock.fail_reauthentication();

        let outcomes = f
            .batch
            .run_parallel(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &CancellationToken::new(),
            )
            .await;

        let issued = f.mock.submissions()[0].task_id.clone();
        assert_eq!(outcomes[0].outcome, TargetOutcome::Submitted(issued));
        assert!(matches!(outcomes[1].outcome, TargetOutcome::Halted { .. }));
        assert_eq!(outcomes[2].outcome, TargetOutcome::Aborted);
        assert_eq!(f.mock.submissions().len(), 1);
    }

    #[tokio::test]
    async fn parallel_submits_everything_in_input_order() {
        let f = fixture();
        let names: Vec<String> = (0..20).map(|i| format!("wld/cl{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let ts = targets(&f, &refs);

        let outcomes = f
            .batch
            .run_parallel(
                OperationKind::ComplianceCheck,
                &ts,
                &OperationParams::default(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 20);
        assert_eq!(f.mock.submissions().len(), 20);
        for (outcome, t) in outcomes.iter().zip(&ts) {
            assert_eq!(&outcome.target, t);
            assert!(matches!(outcome.outcome, TargetOutcome::Submitted(_)));
        }
        // Nothing was polled
        assert_eq!(f.mock.get_task_calls(), 0);
    }

    #[tokio::test]
    async fn parallel_reports_duplicates() {
        let f = fixture();
        let ts = targets(&f, &["wld/a"]);
        let doubled = vec![ts[0].clone(), ts[0].clone()];

        let outcomes = f
            .batch
            .run_parallel(
                OperationKind::Transition,
                &doubled,
                &OperationParams::default(),
                &CancellationToken::new(),
            )
            .await;

        // No compliance record: both are rejected, and nothing is submitted
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.outcome, TargetOutcome::Rejected(_))));

        let outcomes = f
            .batch
            .run_parallel(
                OperationKind::ComplianceCheck,
                &doubled,
                &OperationParams::default(),
                &CancellationToken::new(),
            )
            .await;
        let submitted = outcomes
            .iter()
            .filter(|o| matches!(o.outcome, TargetOutcome::Submitted(_)))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| o.outcome == TargetOutcome::Duplicate)
            .count();
        assert_eq!((submitted, duplicates), (1, 1));
    }
}
