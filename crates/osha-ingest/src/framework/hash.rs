//! Content hashing for change detection

use osha_common::checksum::sha256_bytes;
use serde_json::Value;

/// Compact serialization with object keys in sorted order
///
/// `serde_json::Map` is a `BTreeMap` unless the `preserve_order` feature is
/// on, so two documents that differ only in key order print identically.
fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Hex SHA-256 of the canonical serialization
pub fn compute_content_hash(value: &Value) -> String {
    sha256_bytes(canonical_json(value))
}
