//! Core types for orbit.
//!
//! This crate provides the foundational types shared by every other orbit crate:
//!
//! - **Identifiers**: Strongly-typed references for tasks, clusters, domains and images
//! - **Operation kinds**: The three long-running job types the control plane executes
//!
//! # Example
//!
//! ```
//! use orbit_core::{OperationKind, TargetRef, TaskId};
//!
//! // Targets are addressed as `domain/cluster`
//! let target: TargetRef = "mgmt-domain/cl01".parse().unwrap();
//! assert_eq!(target.cluster_id().as_str(), "cl01");
//!
//! // Task identifiers are opaque strings issued by the control plane
//! let task_id = TaskId::new("9f1c2d7e").unwrap();
//! assert_eq!(task_id.as_str(), "9f1c2d7e");
//!
//! assert_eq!(OperationKind::Transition.as_str(), "transition");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;
pub mod kind;

pub use ids::{ClusterId, DomainId, IdError, ImageRef, TargetRef, TaskId};
pub use kind::{OperationKind, UnknownOperationKind};
