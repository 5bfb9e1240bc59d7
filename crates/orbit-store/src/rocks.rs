//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use orbit_core::{ImageRef, TargetRef};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::ComplianceRecord;
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes writers so the latest index is compared and moved atomically.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Read a record by its encoded key.
    fn get_by_key(&self, key: &[u8]) -> Result<Option<ComplianceRecord>> {
        let cf = self.cf(cf::COMPLIANCE)?;

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Collect the keys of every record stored for a target.
    fn record_keys(&self, target: &TargetRef) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(cf::COMPLIANCE)?;
        let prefix = keys::target_prefix(target);

        let mut found = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(&prefix) {
                break;
            }

            found.push(key);
        }

        Ok(found)
    }
}

impl Store for RocksStore {
    fn put_record(&self, record: &ComplianceRecord) -> Result<()> {
        let cf_records = self.cf(cf::COMPLIANCE)?;
        let cf_latest = self.cf(cf::COMPLIANCE_LATEST)?;

        let record_key = keys::record_key(&record.target, &record.image);
        let latest_key = keys::target_prefix(&record.target);
        let value = Self::serialize(record)?;

        let _guard = self.write_lock.lock();
        // Only move the latest index forward in time
        let is_newest = match self.latest_record(&record.target)? {
            Some(current) => current.evaluated_at <= record.evaluated_at,
            None => true,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_records, &record_key, &value);
        if is_newest {
            batch.put_cf(&cf_latest, &latest_key, &record_key);
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            target_ref = %record.target,
            image = %record.image,
            status = ?record.status,
            latest = is_newest,
            "Stored compliance record"
        );

        Ok(())
    }

    fn get_record(
        &self,
        target: &TargetRef,
        image: &ImageRef,
    ) -> Result<Option<ComplianceRecord>> {
        self.get_by_key(&keys::record_key(target, image))
    }

    fn latest_record(&self, target: &TargetRef) -> Result<Option<ComplianceRecord>> {
        let cf_latest = self.cf(cf::COMPLIANCE_LATEST)?;

        let Some(record_key) = self
            .db
            .get_cf(&cf_latest, keys::target_prefix(target))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        self.get_by_key(&record_key)?
            .map(Some)
            .ok_or_else(|| StoreError::DanglingIndex(target.to_string()))
    }

    fn list_records(&self, target: &TargetRef) -> Result<Vec<ComplianceRecord>> {
        let mut records = Vec::new();

        for key in self.record_keys(target)? {
            if let Some(record) = self.get_by_key(&key)? {
                records.push(record);
            }
        }

        Ok(records)
    }

    fn delete_records(&self, target: &TargetRef) -> Result<usize> {
        let cf_records = self.cf(cf::COMPLIANCE)?;
        let cf_latest = self.cf(cf::COMPLIANCE_LATEST)?;

        let _guard = self.write_lock.lock();
        let record_keys = self.record_keys(target)?;
        let count = record_keys.len();

        let mut batch = WriteBatch::default();
        for key in &record_keys {
            batch.delete_cf(&cf_records, key);
        }
        batch.delete_cf(&cf_latest, keys::target_prefix(target));

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(count)
    }
}
