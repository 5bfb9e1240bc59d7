//! Key encoding utilities for `RocksDB`.
//!
//! Target and image references are variable-length strings, so keys are built
//! from their blake3 digests. Fixed-width digests keep prefix scans exact: a
//! target prefix can never match the start of a longer target's key.

use orbit_core::{ImageRef, TargetRef};

/// Width of a single digest component in bytes.
pub const DIGEST_LEN: usize = 32;

/// Digest a target reference.
#[must_use]
pub fn target_digest(target: &TargetRef) -> [u8; DIGEST_LEN] {
    *blake3::hash(target.to_string().as_bytes()).as_bytes()
}

/// Digest an image reference.
#[must_use]
pub fn image_digest(image: &ImageRef) -> [u8; DIGEST_LEN] {
    *blake3::hash(image.as_str().as_bytes()).as_bytes()
}

/// Encode a record key: `digest(target) || digest(image)`.
#[must_use]
pub fn record_key(target: &TargetRef, image: &ImageRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(DIGEST_LEN * 2);
    key.extend_from_slice(&target_digest(target));
    key.extend_from_slice(&image_digest(image));
    key
}

/// Encode a target prefix for scanning all records of a target.
///
/// Also used as the key of the target's latest-record index entry.
#[must_use]
pub fn target_prefix(target: &TargetRef) -> Vec<u8> {
    target_digest(target).to_vec()
}
