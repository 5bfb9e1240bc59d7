//! Core identifier types for orbit.
//!
//! Every identifier here is issued by the remote control plane and treated as
//! opaque: orbit never derives meaning from its contents. The newtypes exist so
//! a task id can never be passed where an image reference is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between the domain and cluster halves of a [`TargetRef`].
const TARGET_SEPARATOR: char = '/';

/// Defines an opaque, non-empty string identifier.
///
/// Each generated type validates on construction and (de)serializes as a plain
/// string.
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, allow_separator = $allow_sep:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier, validating its contents.
            ///
            /// # Errors
            ///
            /// Returns an error if the value is empty, contains whitespace, or
            /// contains a `/` where one is not allowed.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate(&value, $allow_sep)?;
                Ok(Self(value))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }
    };
}

opaque_id!(
    /// Identifier of a long-running task, issued by the control plane on submission.
    ///
    /// This is the sole key for resuming a failed operation.
    TaskId,
    allow_separator = true
);

opaque_id!(
    /// Identifier of a workload domain.
    DomainId,
    allow_separator = false
);

opaque_id!(
    /// Identifier of a cluster within a domain.
    ClusterId,
    allow_separator = false
);

opaque_id!(
    /// Reference to an image known to the control plane.
    ImageRef,
    allow_separator = true
);

fn validate(value: &str, allow_separator: bool) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.chars().any(char::is_whitespace) {
        return Err(IdError::Whitespace);
    }
    if !allow_separator && value.contains(TARGET_SEPARATOR) {
        return Err(IdError::UnexpectedSeparator);
    }
    Ok(())
}

/// The entity an operation acts on: a cluster, keyed by domain and cluster id.
///
/// Rendered and parsed as `domain/cluster`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetRef {
    domain_id: DomainId,
    cluster_id: ClusterId,
}

impl TargetRef {
    /// Create a target reference from its parts.
    #[must_use]
    pub const fn new(domain_id: DomainId, cluster_id: ClusterId) -> Self {
        Self {
            domain_id,
            cluster_id,
        }
    }

    /// The domain the cluster belongs to.
    #[must_use]
    pub const fn domain_id(&self) -> &DomainId {
        &self.domain_id
    }

    /// The cluster identifier.
    #[must_use]
    pub const fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }
}

impl fmt::Debug for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetRef({self})")
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TARGET_SEPARATOR}{}", self.domain_id, self.cluster_id)
    }
}

impl FromStr for TargetRef {
    type Err = IdError;

    /// Parse a `TargetRef` from `domain/cluster`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, cluster) = s
            .split_once(TARGET_SEPARATOR)
            .ok_or(IdError::MissingSeparator)?;
        Ok(Self::new(DomainId::new(domain)?, ClusterId::new(cluster)?))
    }
}

impl TryFrom<String> for TargetRef {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetRef> for String {
    fn from(target: TargetRef) -> Self {
        target.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier is empty.
    #[error("identifier must not be empty")]
    Empty,

    /// The identifier contains whitespace.
    #[error("identifier must not contain whitespace")]
    Whitespace,

    /// A domain or cluster identifier contains the target separator.
    #[error("identifier must not contain '/'")]
    UnexpectedSeparator,

    /// A target reference is not in `domain/cluster` form.
    #[error("target must be in the form 'domain/cluster'")]
    MissingSeparator,
}
