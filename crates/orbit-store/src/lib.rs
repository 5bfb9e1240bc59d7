//! `RocksDB` compliance snapshot cache for orbit.
//!
//! Compliance evaluations are owned by the control plane. Once an evaluation
//! completes, orbit writes a snapshot of the result here so the transition gate
//! can check it without another round trip. The cache is write-through: orbit
//! never edits a record, it only replaces it with a newer evaluation.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `compliance`: Records keyed by `digest(target) || digest(image)`
//! - `compliance_latest`: Index from `digest(target)` to the newest record key
//!
//! # Example
//!
//! ```no_run
//! use orbit_store::{RocksStore, Store};
//! use orbit_core::TargetRef;
//!
//! let store = RocksStore::open("/tmp/orbit-db").unwrap();
//!
//! let target: TargetRef = "wld-01/cl01".parse().unwrap();
//! if let Some(record) = store.latest_record(&target).unwrap() {
//!     println!("{} evaluated against {}: {:?}", target, record.image, record.status);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{ComplianceRecord, ComplianceStatus};

use orbit_core::{ImageRef, TargetRef};

/// The storage trait for compliance snapshots.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    /// Insert or replace the record for `(record.target, record.image)`.
    ///
    /// This also moves the target's latest index if the record is at least as
    /// new as the current latest.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_record(&self, record: &ComplianceRecord) -> Result<()>;

    /// Get the record for a target evaluated against a specific image.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_record(&self, target: &TargetRef, image: &ImageRef)
        -> Result<Option<ComplianceRecord>>;

    /// Get the most recent record for a target, regardless of image.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn latest_record(&self, target: &TargetRef) -> Result<Option<ComplianceRecord>>;

    /// List every record held for a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_records(&self, target: &TargetRef) -> Result<Vec<ComplianceRecord>>;

    /// Delete every record held for a target.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_records(&self, target: &TargetRef) -> Result<usize>;
}
