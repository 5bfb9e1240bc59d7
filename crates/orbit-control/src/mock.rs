//! In-memory control plane for tests.
//!
//! Tasks follow scripts: each `get_task` call consumes the next scripted
//! poll, and the last one sticks. Submissions enforce the one-in-flight rule
//! per `(kind, target)` the way the real control plane does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use orbit_core::{ImageRef, OperationKind, TargetRef, TaskId};
use parking_lot::Mutex;

use crate::client::ControlPlaneClient;
use crate::clock::ManualClock;
use crate::error::{ControlError, Result};
use crate::types::{
    ComplianceReport, OperationParams, SubStep, TargetState, TaskError, TaskSnapshot, TaskStatus,
};

/// One scripted answer to `get_task`.
#[derive(Debug, Clone)]
pub struct ScriptedPoll {
    status: TaskStatus,
    sub_steps: Vec<SubStep>,
    error: Option<TaskError>,
}

impl ScriptedPoll {
    /// A poll reporting `status` with no sub-steps.
    #[must_use]
    pub const fn status(status: TaskStatus) -> Self {
        Self {
            status,
            sub_steps: Vec::new(),
            error: None,
        }
    }

    /// A successful poll.
    #[must_use]
    pub const fn succeeded() -> Self {
        Self::status(TaskStatus::Successful)
    }

    /// A failed poll carrying an error.
    #[must_use]
    pub fn failed(code: &str, message: &str) -> Self {
        Self {
            status: TaskStatus::Failed,
            sub_steps: Vec::new(),
            error: Some(TaskError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }

    /// Add a sub-step.
    #[must_use]
    pub fn step(mut self, name: &str, status: TaskStatus) -> Self {
        self.sub_steps.push(SubStep::new(name, status));
        self
    }
}

/// A fault injected into the next `get_task` call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail with `Transport`.
    Transport(String),
    /// Fail with `SessionExpired`.
    SessionExpired,
    /// Answer normally, but only after the clock has advanced this much.
    Hang(Duration),
    /// Fail as if renewing the access token hit a network error.
    TokenRenewal,
    /// Fail with `TaskNotFound`, as if the task had been purged.
    Purged,
}

/// A recorded submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Operation kind.
    pub kind: OperationKind,
    /// Target.
    pub target: TargetRef,
    /// Parameters sent.
    pub params: OperationParams,
    /// Issued id.
    pub task_id: TaskId,
}

#[derive(Debug)]
struct MockTask {
    snapshot: TaskSnapshot,
    params: OperationParams,
    script: VecDeque<ScriptedPoll>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    tasks: HashMap<TaskId, MockTask>,
    plans: HashMap<(OperationKind, TargetRef), VecDeque<Vec<ScriptedPoll>>>,
    resume_plans: HashMap<(OperationKind, TargetRef), VecDeque<Vec<ScriptedPoll>>>,
    refused_resumes: HashSet<TaskId>,
    submit_faults: HashMap<TargetRef, VecDeque<ControlErrorKind>>,
    poll_faults: VecDeque<Fault>,
    targets: HashMap<TargetRef, TargetState>,
    images: HashSet<ImageRef>,
    compliance: HashMap<TargetRef, ComplianceReport>,
    submissions: Vec<Submission>,
    resumes: Vec<TaskId>,
    reauth_count: usize,
    reauth_fails: bool,
    get_task_calls: usize,
    remote_calls: usize,
}

/// Submission faults. `ControlError` is not `Clone`, so faults are stored by kind.
#[derive(Debug, Clone, Copy)]
enum ControlErrorKind {
    Transport,
    SessionExpired,
}

/// Scriptable in-memory control plane.
#[derive(Debug, Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
    clock: Option<Arc<ManualClock>>,
}

impl MockControlPlane {
    /// Create an empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a control plane whose hangs advance `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            state: Mutex::default(),
            clock: Some(clock),
        }
    }

    /// Register a target, optionally running an image.
    pub fn add_target(&self, target: &TargetRef, current_image: Option<ImageRef>) {
        self.state.lock().targets.insert(
            target.clone(),
            TargetState {
                target: target.clone(),
                current_image,
            },
        );
    }

    /// Register an image as present.
    pub fn add_image(&self, image: ImageRef) {
        self.state.lock().images.insert(image);
    }

    /// Set the compliance report returned for a target.
    pub fn set_compliance(&self, target: &TargetRef, report: ComplianceReport) {
        self.state.lock().compliance.insert(target.clone(), report);
    }

    /// Script the polls for the next submission of `(kind, target)`.
    ///
    /// Unscripted submissions succeed on their first poll.
    pub fn script(&self, kind: OperationKind, target: &TargetRef, polls: Vec<ScriptedPoll>) {
        self.state
            .lock()
            .plans
            .entry((kind, target.clone()))
            .or_default()
            .push_back(polls);
    }

    /// Script the polls that follow the next resume of `(kind, target)`.
    ///
    /// Unscripted resumes succeed on their first poll.
    pub fn script_resume(&self, kind: OperationKind, target: &TargetRef, polls: Vec<ScriptedPoll>) {
        self.state
            .lock()
            .resume_plans
            .entry((kind, target.clone()))
            .or_default()
            .push_back(polls);
    }

    /// Make the control plane refuse to resume a task.
    pub fn refuse_resume(&self, task_id: &TaskId) {
        self.state.lock().refused_resumes.insert(task_id.clone());
    }

    /// Inject a fault into the next `get_task` call.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().poll_faults.push_back(fault);
    }

    /// Fail the next submission for `target` with a transport error.
    pub fn fail_next_submit(&self, target: &TargetRef) {
        self.push_submit_fault(target, ControlErrorKind::Transport);
    }

    /// Reject the session on the next submission for `target`.
    pub fn expire_next_submit(&self, target: &TargetRef) {
        self.push_submit_fault(target, ControlErrorKind::SessionExpired);
    }

    fn push_submit_fault(&self, target: &TargetRef, kind: ControlErrorKind) {
        self.state
            .lock()
            .submit_faults
            .entry(target.clone())
            .or_default()
            .push_back(kind);
    }

    /// Make every reauthentication fail.
    pub fn fail_reauthentication(&self) {
        self.state.lock().reauth_fails = true;
    }

    /// Insert a task directly, e.g. one submitted by an earlier process.
    pub fn insert_task(&self, snapshot: TaskSnapshot) {
        self.state.lock().tasks.insert(
            snapshot.id.clone(),
            MockTask {
                snapshot,
                params: OperationParams::default(),
                script: VecDeque::new(),
            },
        );
    }

    /// Submissions received so far, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Resumes received so far, in order.
    #[must_use]
    pub fn resumes(&self) -> Vec<TaskId> {
        self.state.lock().resumes.clone()
    }

    /// Number of reauthentications.
    #[must_use]
    pub fn reauth_count(&self) -> usize {
        self.state.lock().reauth_count
    }

    /// Number of `get_task` calls, including failed ones.
    #[must_use]
    pub fn get_task_calls(&self) -> usize {
        self.state.lock().get_task_calls
    }

    /// Number of calls made through the client trait.
    #[must_use]
    pub fn remote_calls(&self) -> usize {
        self.state.lock().remote_calls
    }

    fn count_call(&self) {
        self.state.lock().remote_calls += 1;
    }

    /// Current snapshot of a task.
    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.state
            .lock()
            .tasks
            .get(task_id)
            .map(|t| t.snapshot.clone())
    }
}

impl MockState {
    fn advance(&mut self, task_id: &TaskId) -> Option<TaskSnapshot> {
        let task = self.tasks.get_mut(task_id)?;
        if let Some(poll) = task.script.pop_front() {
            task.snapshot.status = poll.status;
            task.snapshot.sub_steps = poll.sub_steps;
            task.snapshot.last_error = poll.error;
            task.snapshot.completed_at = poll.status.is_terminal().then(Utc::now);

            if poll.status == TaskStatus::Successful {
                let (kind, target, image) = (
                    task.snapshot.kind,
                    task.snapshot.target.clone(),
                    task.params.image.clone(),
                );
                self.apply_success(kind, &target, image);
            }
        }
        self.tasks.get(task_id).map(|t| t.snapshot.clone())
    }

    /// Reflect a finished operation in the simulated resources.
    fn apply_success(&mut self, kind: OperationKind, target: &TargetRef, image: Option<ImageRef>) {
        let Some(image) = image else { return };
        match kind {
            OperationKind::ImageImport => {
                self.images.insert(image);
            }
            OperationKind::Transition => {
                if let Some(state) = self.targets.get_mut(target) {
                    state.current_image = Some(image);
                }
            }
            OperationKind::ComplianceCheck => {}
        }
    }
}

fn default_script() -> Vec<ScriptedPoll> {
    vec![ScriptedPoll::succeeded()]
}

#[async_trait]
impl ControlPlaneClient for MockControlPlane {
    async fn submit(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<TaskId> {
        self.count_call();
        let mut state = self.state.lock();

        if let Some(fault) = state
            .submit_faults
            .get_mut(target)
            .and_then(VecDeque::pop_front)
        {
            return Err(match fault {
                ControlErrorKind::Transport => {
                    ControlError::Transport("connection reset".to_string())
                }
                ControlErrorKind::SessionExpired => ControlError::SessionExpired,
            });
        }

        let in_flight = state.tasks.values().any(|t| {
            t.snapshot.kind == kind
                && t.snapshot.target == *target
                && !t.snapshot.status.is_terminal()
        });
        if in_flight {
            return Err(ControlError::DuplicateInFlight {
                kind,
                target: target.clone(),
            });
        }

        state.next_id += 1;
        let task_id = TaskId::new(format!("task-{:04}", state.next_id))
            .map_err(|e| ControlError::Internal(e.to_string()))?;
        let script = state
            .plans
            .get_mut(&(kind, target.clone()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(default_script);

        state.tasks.insert(
            task_id.clone(),
            MockTask {
                snapshot: TaskSnapshot {
                    id: task_id.clone(),
                    kind,
                    target: target.clone(),
                    status: TaskStatus::Queued,
                    sub_steps: Vec::new(),
                    last_error: None,
                    completed_at: None,
                },
                params: params.clone(),
                script: script.into(),
            },
        );
        state.submissions.push(Submission {
            kind,
            target: target.clone(),
            params: params.clone(),
            task_id: task_id.clone(),
        });

        Ok(task_id)
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        self.count_call();
        let fault = {
            let mut state = self.state.lock();
            state.get_task_calls += 1;
            state.poll_faults.pop_front()
        };

        match fault {
            Some(Fault::Transport(message)) => return Err(ControlError::Transport(message)),
            Some(Fault::SessionExpired) => return Err(ControlError::SessionExpired),
            Some(Fault::TokenRenewal) => {
                return Err(ControlError::Auth(orbit_auth::AuthError::Request(
                    "HTTP 503 Service Unavailable".to_string(),
                )))
            }
            Some(Fault::Purged) => return Err(ControlError::TaskNotFound(task_id.clone())),
            Some(Fault::Hang(duration)) => {
                if let Some(clock) = &self.clock {
                    clock.advance(duration);
                }
            }
            None => {}
        }

        self.state
            .lock()
            .advance(task_id)
            .ok_or_else(|| ControlError::TaskNotFound(task_id.clone()))
    }

    async fn resume_task(&self, task_id: &TaskId) -> Result<TaskId> {
        self.count_call();
        let mut state = self.state.lock();

        if state.refused_resumes.contains(task_id) {
            return Err(ControlError::NotRetryable {
                task_id: task_id.clone(),
                reason: "resume refused by control plane".to_string(),
            });
        }

        let (kind, target, status) = {
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| ControlError::TaskNotFound(task_id.clone()))?;
            (
                task.snapshot.kind,
                task.snapshot.target.clone(),
                task.snapshot.status,
            )
        };

        if status != TaskStatus::Failed {
            return Err(ControlError::NotRetryable {
                task_id: task_id.clone(),
                reason: format!("task is {status}"),
            });
        }

        let script = state
            .resume_plans
            .get_mut(&(kind, target))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(default_script);

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.snapshot.status = TaskStatus::InProgress;
            task.snapshot.last_error = None;
            task.snapshot.completed_at = None;
            task.script = script.into();
        }
        state.resumes.push(task_id.clone());

        Ok(task_id.clone())
    }

    async fn list_tasks(
        &self,
        kind: OperationKind,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskId>> {
        self.count_call();
        let state = self.state.lock();
        let mut ids: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.snapshot.kind == kind)
            .filter(|t| status.map_or(true, |s| t.snapshot.status == s))
            .map(|t| t.snapshot.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn reauthenticate(&self) -> Result<()> {
        self.count_call();
        let mut state = self.state.lock();
        state.reauth_count += 1;
        if state.reauth_fails {
            return Err(ControlError::Auth(orbit_auth::AuthError::InvalidCredentials));
        }
        Ok(())
    }

    async fn get_target(&self, target: &TargetRef) -> Result<Option<TargetState>> {
        self.count_call();
        Ok(self.state.lock().targets.get(target).cloned())
    }

    async fn image_exists(&self, image: &ImageRef) -> Result<bool> {
        self.count_call();
        Ok(self.state.lock().images.contains(image))
    }

    async fn get_compliance(&self, target: &TargetRef) -> Result<Option<ComplianceReport>> {
        self.count_call();
        Ok(self.state.lock().compliance.get(target).cloned())
    }
}
