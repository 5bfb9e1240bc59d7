//! Task, progress, and outcome types for the orchestration engine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orbit_core::{ImageRef, OperationKind, TargetRef, TaskId};
use orbit_store::ComplianceStatus;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Status of a remote task as tracked by orbit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted by the control plane but not started.
    Queued,
    /// Running.
    InProgress,
    /// Finished successfully.
    Successful,
    /// Finished with an error. May be resumable.
    Failed,
    /// The control plane reported a status orbit does not recognise.
    Unknown,
}

impl TaskStatus {
    /// Map a status string reported by the control plane.
    ///
    /// Matching ignores case and treats `-` and spaces as `_`. Anything
    /// unrecognised becomes [`TaskStatus::Unknown`].
    #[must_use]
    pub fn from_remote(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "QUEUED" | "PENDING" | "NOT_STARTED" => Self::Queued,
            "IN_PROGRESS" | "RUNNING" => Self::InProgress,
            "SUCCESSFUL" | "SUCCEEDED" | "COMPLETED" => Self::Successful,
            "FAILED" | "CANCELLED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// The status as the control plane spells it in query filters.
    #[must_use]
    pub const fn as_remote(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Successful => "SUCCESSFUL",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Returns true once the task will not change status without a resume.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Unknown)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_remote())
    }
}

/// One named sub-step of a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubStep {
    /// Sub-step name as reported by the control plane.
    pub name: String,
    /// Sub-step status.
    pub status: TaskStatus,
}

impl SubStep {
    /// Create a sub-step.
    #[must_use]
    pub fn new(name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// Error reported by the control plane for a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A point-in-time view of a remote task, as returned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: TaskId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Target the task acts on.
    pub target: TargetRef,
    /// Reported status.
    pub status: TaskStatus,
    /// Reported sub-steps, in execution order.
    pub sub_steps: Vec<SubStep>,
    /// Error details, when failed.
    pub last_error: Option<TaskError>,
    /// Completion time, when terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

/// In-memory handle for one submitted remote operation.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// Opaque identifier issued by the control plane; the only resume key.
    pub id: TaskId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Target the task acts on.
    pub target: TargetRef,
    /// Last observed status.
    pub status: TaskStatus,
    /// Last observed sub-steps.
    pub sub_steps: Vec<SubStep>,
    /// When orbit started tracking the task.
    pub started_at: DateTime<Utc>,
    /// Completion time. `None` while queued or in progress.
    pub completed_at: Option<DateTime<Utc>>,
    /// Error details. Present only when failed.
    pub last_error: Option<TaskError>,
}

impl TaskHandle {
    /// Create a handle for a freshly submitted task.
    #[must_use]
    pub fn new(id: TaskId, kind: OperationKind, target: TargetRef) -> Self {
        Self {
            id,
            kind,
            target,
            status: TaskStatus::Queued,
            sub_steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            last_error: None,
        }
    }

    /// Rebuild a handle from a fetched snapshot, e.g. before a resume.
    #[must_use]
    pub fn from_snapshot(snapshot: TaskSnapshot) -> Self {
        Self {
            id: snapshot.id,
            kind: snapshot.kind,
            target: snapshot.target,
            status: snapshot.status,
            sub_steps: snapshot.sub_steps,
            started_at: Utc::now(),
            completed_at: snapshot.completed_at,
            last_error: snapshot.last_error,
        }
    }

    /// Number of sub-steps that have completed successfully.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.sub_steps
            .iter()
            .filter(|s| s.status == TaskStatus::Successful)
            .count()
    }

    /// Total number of sub-steps reported so far.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.sub_steps.len()
    }

    /// Name of the sub-step currently running, or the next one queued.
    #[must_use]
    pub fn current_sub_step(&self) -> Option<&str> {
        self.sub_steps
            .iter()
            .find(|s| s.status == TaskStatus::InProgress)
            .or_else(|| {
                self.sub_steps
                    .iter()
                    .find(|s| s.status == TaskStatus::Queued)
            })
            .map(|s| s.name.as_str())
    }

    /// Name of the first sub-step that did not succeed, for failure attribution.
    #[must_use]
    pub fn failed_sub_step(&self) -> Option<&str> {
        self.sub_steps
            .iter()
            .find(|s| matches!(s.status, TaskStatus::Failed | TaskStatus::Unknown))
            .map(|s| s.name.as_str())
    }
}

/// Progress notification emitted after every successful poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Task being monitored.
    pub task_id: TaskId,
    /// Target the task acts on.
    pub target: TargetRef,
    /// Current status.
    pub status: TaskStatus,
    /// Sub-steps completed.
    pub completed: usize,
    /// Sub-steps reported.
    pub total: usize,
    /// Sub-step currently running, if any.
    pub current_sub_step: Option<String>,
    /// Time since monitoring began.
    pub elapsed: Duration,
}

/// Notification that no poll has succeeded for longer than the stall threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StallEvent {
    /// Task being monitored.
    pub task_id: TaskId,
    /// Target the task acts on.
    pub target: TargetRef,
    /// Time since the last successful poll.
    pub since_last_success: Duration,
}

/// Final state of a monitored task.
///
/// A remote failure is a `TerminalResult` with `status == Failed`, not an
/// `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalResult {
    /// Task identifier.
    pub task_id: TaskId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Target the task acted on.
    pub target: TargetRef,
    /// Terminal status.
    pub status: TaskStatus,
    /// Error details, when failed.
    pub last_error: Option<TaskError>,
    /// Sub-step that failed, when known.
    pub failed_sub_step: Option<String>,
    /// Time spent monitoring.
    pub elapsed: Duration,
}

impl TerminalResult {
    /// Build the result for a handle that reached a terminal status.
    #[must_use]
    pub fn from_handle(handle: &TaskHandle, elapsed: Duration) -> Self {
        Self {
            task_id: handle.id.clone(),
            kind: handle.kind,
            target: handle.target.clone(),
            status: handle.status,
            last_error: handle.last_error.clone(),
            failed_sub_step: handle.failed_sub_step().map(str::to_string),
            elapsed,
        }
    }

    /// Returns true if the task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Successful
    }
}

/// Summary row returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    /// Task identifier.
    pub task_id: TaskId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Target the task acts on.
    pub target: TargetRef,
    /// Current status.
    pub status: TaskStatus,
    /// Sub-steps completed.
    pub completed: usize,
    /// Sub-steps reported.
    pub total: usize,
    /// Error details, when failed.
    pub last_error: Option<TaskError>,
    /// Completion time, when terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<TaskSnapshot> for TaskSummary {
    fn from(snapshot: TaskSnapshot) -> Self {
        let completed = snapshot
            .sub_steps
            .iter()
            .filter(|s| s.status == TaskStatus::Successful)
            .count();
        Self {
            total: snapshot.sub_steps.len(),
            completed,
            task_id: snapshot.id,
            kind: snapshot.kind,
            target: snapshot.target,
            status: snapshot.status,
            last_error: snapshot.last_error,
            completed_at: snapshot.completed_at,
        }
    }
}

/// How a batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One target at a time, each polled to a terminal status.
    #[default]
    Serial,
    /// Submit every target without waiting.
    Parallel,
}

/// Kind-specific submission parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationParams {
    /// Image to import, evaluate against, or transition onto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    /// Source location for an image import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl OperationParams {
    /// Parameters naming an image.
    #[must_use]
    pub fn with_image(image: ImageRef) -> Self {
        Self {
            image: Some(image),
            source: None,
        }
    }
}

/// Current state of a target as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetState {
    /// The target.
    pub target: TargetRef,
    /// Image the target currently runs, if known.
    pub current_image: Option<ImageRef>,
}

/// Latest compliance evaluation for a target, as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceReport {
    /// Image the target was evaluated against.
    pub image: ImageRef,
    /// Evaluation outcome.
    pub status: ComplianceStatus,
    /// When the evaluation finished.
    pub evaluated_at: DateTime<Utc>,
}

/// What happened to one target of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Polled to a terminal status (which may be `Failed`).
    Completed(TerminalResult),
    /// Submitted without waiting (parallel mode).
    Submitted(TaskId),
    /// Removed by validation before submission.
    Rejected(ValidationError),
    /// A task of the same kind is already in flight for the target.
    Duplicate,
    /// Still failed after the maximum number of resumes.
    RetryLimitExceeded(TerminalResult),
    /// Submission or monitoring failed with an error local to this target.
    ///
    /// `task_id` is set when the task had already been issued; it stays valid
    /// for status queries and retries.
    Errored {
        /// The error.
        error: String,
        /// The issued task, if any.
        task_id: Option<TaskId>,
    },
    /// Failed with an error that stops the rest of the batch, such as
    /// rejected credentials or a store failure.
    Halted {
        /// The error.
        error: String,
        /// The issued task, if any.
        task_id: Option<TaskId>,
    },
    /// Not submitted because an earlier failure aborted the batch.
    Aborted,
    /// Not submitted, or monitoring stopped, because the run was cancelled.
    Cancelled {
        /// The issued task, if monitoring was interrupted. It keeps running.
        task_id: Option<TaskId>,
    },
}

impl TargetOutcome {
    /// The remote task this outcome refers to, if one was issued.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Completed(result) | Self::RetryLimitExceeded(result) => Some(&result.task_id),
            Self::Submitted(task_id) => Some(task_id),
            Self::Errored { task_id, .. }
            | Self::Halted { task_id, .. }
            | Self::Cancelled { task_id } => task_id.as_ref(),
            Self::Rejected(_) | Self::Duplicate | Self::Aborted => None,
        }
    }
}

/// Outcome of one target in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerTargetOutcome {
    /// The target.
    pub target: TargetRef,
    /// What happened to it.
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between task polls (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Gap between successful polls that counts as a stall (seconds).
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_seconds: u64,
    /// Resumes attempted per target in a serial batch.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Concurrent submissions in a parallel batch.
    #[serde(default = "default_max_parallel_submissions")]
    pub max_parallel_submissions: usize,
    /// Compliance records older than this block a transition (seconds).
    #[serde(default)]
    pub max_record_age_seconds: Option<u64>,
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_stall_threshold() -> u64 {
    300 // 5 minutes
}

const fn default_max_retry_attempts() -> u32 {
    3
}

const fn default_max_parallel_submissions() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            stall_threshold_seconds: default_stall_threshold(),
            max_retry_attempts: default_max_retry_attempts(),
            max_parallel_submissions: default_max_parallel_submissions(),
            max_record_age_seconds: None,
        }
    }
}

impl OrchestratorConfig {
    /// Get the poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Get the stall threshold as a `Duration`.
    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_seconds)
    }

    /// Get the maximum compliance record age, if enforced.
    #[must_use]
    pub fn max_record_age(&self) -> Option<Duration> {
        self.max_record_age_seconds.map(Duration::from_secs)
    }
}
