//! Operation kinds.
//!
//! Each kind maps to one remote long-running job type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of long-running operation submitted to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Import an image into the control plane's depot.
    ImageImport,
    /// Evaluate a cluster's compatibility with an image.
    ComplianceCheck,
    /// Move a cluster onto an image (remediation).
    Transition,
}

impl OperationKind {
    /// All operation kinds, in declaration order.
    pub const ALL: [Self; 3] = [Self::ImageImport, Self::ComplianceCheck, Self::Transition];

    /// The wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ImageImport => "image_import",
            Self::ComplianceCheck => "compliance_check",
            Self::Transition => "transition",
        }
    }

    /// Returns true if submissions of this kind change the state of the target.
    ///
    /// Only state-changing kinds are guarded by the compliance gate.
    #[must_use]
    pub const fn changes_target_state(self) -> bool {
        matches!(self, Self::Transition)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = UnknownOperationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownOperationKind(s.to_string()))
    }
}

/// Error returned when parsing an unrecognised operation kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation kind: {0}")]
pub struct UnknownOperationKind(pub String);
