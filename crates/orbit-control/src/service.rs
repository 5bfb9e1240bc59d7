//! Orchestrator service.
//!
//! The public surface of the engine. [`OrchestratorService`] wires the
//! monitor, retry coordinator, compliance gate, and batch coordinator around
//! one control-plane client and one snapshot store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use orbit_core::{OperationKind, TargetRef, TaskId};
use orbit_store::Store;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchCoordinator, FailurePolicy};
use crate::client::{with_reauth, ControlPlaneClient};
use crate::clock::{Clock, SystemClock};
use crate::error::{ControlError, Result};
use crate::gate::ComplianceGate;
use crate::monitor::TaskMonitor;
use crate::progress::{ProgressSink, TracingProgress};
use crate::retry::RetryCoordinator;
use crate::types::{
    ExecutionMode, OperationParams, OrchestratorConfig, PerTargetOutcome, TaskSnapshot,
    TaskStatus, TaskSummary, TerminalResult,
};

/// Lifecycle operations exposed to callers.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Validate and submit one operation, then poll it to a terminal status.
    async fn submit_and_monitor(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<TerminalResult>;

    /// Run one operation kind over many targets.
    ///
    /// Serial mode polls each target to completion before the next one and
    /// consults `policy` on failure. Parallel mode only submits.
    async fn submit_batch(
        &self,
        kind: OperationKind,
        targets: &[TargetRef],
        params: &OperationParams,
        mode: ExecutionMode,
        policy: &dyn FailurePolicy,
    ) -> Result<Vec<PerTargetOutcome>>;

    /// Resume a failed task from its last completed sub-step.
    async fn retry_failed(&self, task_id: &TaskId) -> Result<TerminalResult>;

    /// Summaries of the control plane's tasks of `kind`, optionally for one
    /// target or in one status.
    ///
    /// Tasks purged between listing and lookup are left out. The latest
    /// successful compliance check per target is written through to the
    /// snapshot cache, so checks submitted in parallel can gate a transition.
    async fn query_status(
        &self,
        kind: OperationKind,
        target: Option<&TargetRef>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskSummary>>;

    /// Stop polling and submitting. Remote tasks keep running.
    fn cancel(&self);
}

/// Default [`Orchestrator`].
pub struct OrchestratorService {
    client: Arc<dyn ControlPlaneClient>,
    gate: Arc<ComplianceGate>,
    batch: BatchCoordinator,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl OrchestratorService {
    /// Create a service on the system clock, reporting progress via tracing.
    #[must_use]
    pub fn new(
        client: Arc<dyn ControlPlaneClient>,
        store: Arc<dyn Store>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_parts(
            client,
            store,
            Arc::new(SystemClock),
            Arc::new(TracingProgress),
            config,
        )
    }

    /// Create a service with an explicit clock and progress sink.
    #[must_use]
    pub fn with_parts(
        client: Arc<dyn ControlPlaneClient>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        progress: Arc<dyn ProgressSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let monitor = Arc::new(TaskMonitor::new(
            client.clone(),
            clock,
            progress,
            &config,
        ));
        let gate = Arc::new(ComplianceGate::new(
            client.clone(),
            store,
            config.max_record_age(),
        ));
        let retry = Arc::new(RetryCoordinator::new(client.clone(), monitor.clone()));
        let batch = BatchCoordinator::new(client.clone(), gate.clone(), monitor, retry, &config);

        Self {
            client,
            gate,
            batch,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token tripped by [`Orchestrator::cancel`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The compliance gate.
    #[must_use]
    pub fn gate(&self) -> &ComplianceGate {
        &self.gate
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Fetch one task; `None` if the control plane no longer knows it.
    async fn lookup(&self, task_id: &TaskId) -> Result<Option<TaskSnapshot>> {
        let client = self.client.as_ref();
        match with_reauth(client, move || client.get_task(task_id)).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(ControlError::TaskNotFound(_)) => {
                tracing::debug!(task_id = %task_id, "Task purged since listing, skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write the latest successful check per target through to the store.
    async fn sync_checks(&self, snapshots: &[TaskSnapshot]) {
        let mut latest: HashMap<&TargetRef, &TaskSnapshot> = HashMap::new();
        for snapshot in snapshots
            .iter()
            .filter(|s| s.kind == OperationKind::ComplianceCheck)
            .filter(|s| s.status == TaskStatus::Successful)
        {
            latest
                .entry(&snapshot.target)
                .and_modify(|current| {
                    if snapshot.completed_at > current.completed_at {
                        *current = snapshot;
                    }
                })
                .or_insert(snapshot);
        }

        for (target, snapshot) in latest {
            if let Err(e) = self.gate.sync_evaluation(target, &snapshot.id).await {
                tracing::warn!(
                    task_id = %snapshot.id,
                    target_ref = %target,
                    error = %e,
                    "Failed to record compliance evaluation"
                );
            }
        }
    }
}

#[async_trait]
impl Orchestrator for OrchestratorService {
    async fn submit_and_monitor(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<TerminalResult> {
        self.batch.execute(kind, target, params, &self.cancel).await
    }

    async fn submit_batch(
        &self,
        kind: OperationKind,
        targets: &[TargetRef],
        params: &OperationParams,
        mode: ExecutionMode,
        policy: &dyn FailurePolicy,
    ) -> Result<Vec<PerTargetOutcome>> {
        tracing::info!(
            kind = %kind,
            targets = targets.len(),
            mode = ?mode,
            "Starting batch"
        );

        let outcomes = match mode {
            ExecutionMode::Serial => {
                self.batch
                    .run_serial(kind, targets, params, policy, &self.cancel)
                    .await
            }
            ExecutionMode::Parallel => {
                self.batch
                    .run_parallel(kind, targets, params, &self.cancel)
                    .await
            }
        };
        Ok(outcomes)
    }

    async fn retry_failed(&self, task_id: &TaskId) -> Result<TerminalResult> {
        self.batch.resume(task_id, &self.cancel).await
    }

    async fn query_status(
        &self,
        kind: OperationKind,
        target: Option<&TargetRef>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskSummary>> {
        let client = self.client.as_ref();
        let ids = with_reauth(client, move || client.list_tasks(kind, status)).await?;

        let lookups: Vec<_> = ids.iter().map(|id| self.lookup(id)).collect();
        let found: Vec<Option<TaskSnapshot>> = stream::iter(lookups)
            .buffered(self.config.max_parallel_submissions.max(1))
            .try_collect()
            .await?;

        let snapshots: Vec<TaskSnapshot> = found
            .into_iter()
            .flatten()
            .filter(|s| target.map_or(true, |t| s.target == *t))
            .collect();
        self.sync_checks(&snapshots).await;

        Ok(snapshots.into_iter().map(TaskSummary::from).collect())
    }

    fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.cancel.cancel();
    }
}
