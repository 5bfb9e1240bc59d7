//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Compliance records, keyed by `digest(target) || digest(image)`.
    pub const COMPLIANCE: &str = "compliance";

    /// Index: newest compliance record key per target, keyed by `digest(target)`.
    pub const COMPLIANCE_LATEST: &str = "compliance_latest";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::COMPLIANCE, cf::COMPLIANCE_LATEST]
}
