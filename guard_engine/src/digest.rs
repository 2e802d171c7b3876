//! Deterministic SHA-256 fingerprints of serializable values.
//!
//! Used to identify the policy and configuration that produced a decision.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the JSON form of `value`.
///
/// The value goes through [`serde_json::Value`] first, whose objects keep
/// their keys sorted, so logically equal values hash equally regardless of
/// map iteration order.
#[must_use]
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_value(value)
        .and_then(|json| serde_json::to_vec(&json))
        .unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
