//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use orbit_control::{
    ExecutionMode, FailureDecision, FailurePolicy, FixedPolicy, OperationParams,
    OrchestratorConfig, TaskStatus, UnattendedPolicy,
};
use orbit_core::{ImageRef, OperationKind, TargetRef, TaskId};

/// Orbit - drive lifecycle operations on a remote control plane.
#[derive(Parser, Debug)]
#[command(name = "orbit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Control plane base URL.
    #[arg(long, env = "ORBIT_URL")]
    pub url: String,

    /// Control plane user.
    #[arg(long, env = "ORBIT_USERNAME")]
    pub username: String,

    /// Control plane password.
    #[arg(long, env = "ORBIT_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Directory holding the compliance snapshot cache.
    #[arg(long, env = "ORBIT_DATA_DIR", default_value = "/var/lib/orbit")]
    pub data_dir: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Engine tuning knobs.
#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Seconds between task polls.
    #[arg(long, env = "ORBIT_POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval: u64,

    /// Seconds without a successful poll before a stall is reported.
    #[arg(long, env = "ORBIT_STALL_THRESHOLD", default_value_t = 300)]
    pub stall_threshold: u64,

    /// Resume attempts per target in a serial batch.
    #[arg(long, env = "ORBIT_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Concurrent submissions in a parallel batch.
    #[arg(long, env = "ORBIT_MAX_PARALLEL", default_value_t = 8)]
    pub max_parallel: usize,

    /// Refuse transitions whose compliance evaluation is older than this many
    /// seconds.
    #[arg(long, env = "ORBIT_MAX_RECORD_AGE")]
    pub max_record_age: Option<u64>,
}

impl EngineArgs {
    /// Build the engine configuration.
    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval_seconds: self.poll_interval,
            stall_threshold_seconds: self.stall_threshold,
            max_retry_attempts: self.max_retries,
            max_parallel_submissions: self.max_parallel,
            max_record_age_seconds: self.max_record_age,
        }
    }
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an operation on one or more targets.
    Run(RunArgs),

    /// Resume a failed task.
    Retry {
        /// Task to resume.
        task_id: TaskId,
    },

    /// List tasks of one kind.
    Status {
        /// Operation kind.
        #[arg(long)]
        kind: OperationKind,

        /// Only show tasks for this target (`domain/cluster`).
        #[arg(long)]
        target: Option<TargetRef>,

        /// Only show tasks in this status (e.g. `failed`, `in_progress`).
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
    },
}

/// Arguments of `orbit run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Operation kind.
    #[arg(long)]
    pub kind: OperationKind,

    /// Targets (`domain/cluster`), processed in the given order.
    #[arg(long = "target", required = true, num_args = 1..)]
    pub targets: Vec<TargetRef>,

    /// Image to import.
    #[arg(long)]
    pub image: Option<ImageRef>,

    /// Location to import the image from.
    #[arg(long)]
    pub source: Option<String>,

    /// Submit every target at once and return without waiting.
    #[arg(long)]
    pub parallel: bool,

    /// Reaction to a failed task in a serial run.
    #[arg(long, value_enum, default_value_t = OnFailure::Unattended)]
    pub on_failure: OnFailure,
}

impl RunArgs {
    /// Operation parameters.
    pub fn params(&self) -> OperationParams {
        OperationParams {
            image: self.image.clone(),
            source: self.source.clone(),
        }
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        if self.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Serial
        }
    }
}

/// Failure policy selector.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Continue past imports and checks, abort on a failed transition.
    Unattended,
    /// Resume the failed task.
    Retry,
    /// Move on to the next target.
    Skip,
    /// Stop the run.
    Abort,
}

impl OnFailure {
    /// The policy this selector stands for.
    pub fn policy(self) -> Box<dyn FailurePolicy> {
        match self {
            Self::Unattended => Box::new(UnattendedPolicy),
            Self::Retry => Box::new(FixedPolicy(FailureDecision::Retry)),
            Self::Skip => Box::new(FixedPolicy(FailureDecision::Skip)),
            Self::Abort => Box::new(FixedPolicy(FailureDecision::Abort)),
        }
    }
}

/// Parse a status filter. Only `unknown` itself maps to `Unknown`.
fn parse_status(value: &str) -> Result<TaskStatus, String> {
    match TaskStatus::from_remote(value) {
        TaskStatus::Unknown if !value.trim().eq_ignore_ascii_case("unknown") => {
            Err(format!("unrecognised task status: {value}"))
        }
        status => Ok(status),
    }
}
