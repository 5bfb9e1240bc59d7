//! Domain types stored in the database.

use chrono::{DateTime, Utc};
use orbit_core::{ImageRef, TargetRef, TaskId};
use serde::{Deserialize, Serialize};

/// A snapshot of one compliance evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    /// The cluster that was evaluated.
    pub target: TargetRef,
    /// The image the cluster was evaluated against.
    pub image: ImageRef,
    /// Outcome of the evaluation.
    pub status: ComplianceStatus,
    /// When the control plane finished the evaluation.
    pub evaluated_at: DateTime<Utc>,
    /// The compliance-check task that produced this record, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Outcome of a compliance evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ComplianceStatus {
    /// The cluster already matches the image.
    Compliant = 1,
    /// The cluster differs from the image and can be transitioned.
    NonCompliant = 2,
    /// The cluster cannot be transitioned onto the image.
    Incompatible = 3,
    /// The control plane could not determine compliance.
    Unknown = 4,
}

impl ComplianceStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `ComplianceStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Compliant),
            2 => Some(Self::NonCompliant),
            3 => Some(Self::Incompatible),
            4 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Parse a status string reported by the control plane.
    ///
    /// Unrecognised values map to [`ComplianceStatus::Unknown`].
    #[must_use]
    pub fn from_remote(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "COMPLIANT" => Self::Compliant,
            "NON_COMPLIANT" | "NOT_COMPLIANT" => Self::NonCompliant,
            "INCOMPATIBLE" => Self::Incompatible,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_roundtrip() {
        for status in [
            ComplianceStatus::Compliant,
            ComplianceStatus::NonCompliant,
            ComplianceStatus::Incompatible,
            ComplianceStatus::Unknown,
        ] {
            assert_eq!(ComplianceStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(ComplianceStatus::from_u8(0), None);
    }

    #[test]
    fn remote_status_parsing() {
        assert_eq!(
            ComplianceStatus::from_remote("NON_COMPLIANT"),
            ComplianceStatus::NonCompliant
        );
        assert_eq!(
            ComplianceStatus::from_remote("non-compliant"),
            ComplianceStatus::NonCompliant
        );
        assert_eq!(
            ComplianceStatus::from_remote("Compliant"),
            ComplianceStatus::Compliant
        );
        assert_eq!(
            ComplianceStatus::from_remote("SOMETHING_NEW"),
            ComplianceStatus::Unknown
        );
    }
}
