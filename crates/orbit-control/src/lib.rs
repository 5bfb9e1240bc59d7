//! Task orchestration engine for orbit.
//!
//! Drives long-running lifecycle operations (image imports, compliance
//! checks, and transitions) on a remote control plane. The control plane
//! executes the work; this crate submits it, polls it to a terminal status,
//! resumes it after a failure, and fans it out over many targets.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          CLI                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OrchestratorService                      │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │   Batch     │ │   Retry     │ │    Compliance       │    │
//! │  │ Coordinator │ │ Coordinator │ │    Gate             │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! │                  ┌─────────────┐                            │
//! │                  │ TaskMonitor │                            │
//! │                  └─────────────┘                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────────┐
//!        │  Store   │   │  Auth    │   │ Control plane│
//!        │ (RocksDB)│   │  (JWT)   │   │   (HTTP)     │
//!        └──────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use orbit_auth::{AuthConfig, Session};
//! use orbit_control::{
//!     HttpControlPlaneClient, OperationParams, Orchestrator, OrchestratorConfig,
//!     OrchestratorService,
//! };
//! use orbit_core::{OperationKind, TargetRef};
//! use orbit_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = AuthConfig::new("https://control.example.com", "admin", "secret");
//! let session = Arc::new(Session::new(auth)?);
//! let client = Arc::new(HttpControlPlaneClient::new("https://control.example.com", session)?);
//! let store = Arc::new(RocksStore::open("/tmp/orbit")?);
//!
//! let orbit = OrchestratorService::new(client, store, OrchestratorConfig::default());
//!
//! let target: TargetRef = "wld-01/cl01".parse()?;
//! let result = orbit
//!     .submit_and_monitor(OperationKind::ComplianceCheck, &target, &OperationParams::default())
//!     .await?;
//!
//! println!("{} finished: {}", result.task_id, result.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Task lifecycle
//!
//! - `Queued` → `InProgress`, `Successful`, `Failed`, or `Unknown`
//! - `InProgress` → `Successful`, `Failed`, or `Unknown`
//! - `Failed` → `InProgress` (resume)
//!
//! See the [`lifecycle`] module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod client;
pub mod clock;
pub mod error;
pub mod gate;
pub mod lifecycle;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod monitor;
pub mod progress;
pub mod retry;
pub mod service;
pub mod types;

pub use batch::{
    BatchCoordinator, FailureContext, FailureDecision, FailurePolicy, FixedPolicy,
    UnattendedPolicy,
};
pub use client::{ControlPlaneClient, HttpControlPlaneClient};
pub use clock::{Clock, SystemClock};
pub use error::{ControlError, Result, ValidationError};
pub use gate::{ComplianceGate, DenyReason, GateDecision};
pub use monitor::TaskMonitor;
pub use progress::{ProgressSink, TracingProgress};
pub use retry::RetryCoordinator;
pub use service::{Orchestrator, OrchestratorService};
pub use types::{
    ExecutionMode, OperationParams, OrchestratorConfig, PerTargetOutcome, ProgressEvent,
    StallEvent, TargetOutcome, TaskHandle, TaskStatus, TaskSummary, TerminalResult,
};

// Re-export commonly used types from dependencies for convenience
pub use orbit_core::{ImageRef, OperationKind, TargetRef, TaskId};
pub use orbit_store::{ComplianceRecord, ComplianceStatus};
