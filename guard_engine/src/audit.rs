//! Audit records for authorization decisions.
//!
//! Every audited decision produces one [`AuditRecord`]. Records render as
//! pretty JSON (one record) or JSON lines (a log stream), and a batch can be
//! reduced to an [`AuditSummary`] with per-reason counts.
//!
//! ## Record fields
//!
//! | Field | Meaning |
//! |---|---|
//! | `timestamp` | UTC time the decision was made |
//! | `role` | role the statement was authorized for |
//! | `sql` | statement text, omitted when `audit.include_sql = false` |
//! | `intent` | extracted intent, absent when denied before parsing |
//! | `decision` | `"Allow"` or `{"Deny": {"reason": ..., ...}}` |
//! | `reason_code` | deny tag, absent on allow |
//! | `intent_source` | name of the extractor that produced the intent |
//! | `policy_fingerprint` | SHA-256 of the policy document |
//! | `config_hash` | SHA-256 of the guard configuration |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Decision, SqlIntent};

/// One audited authorization decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,

    /// Role the statement was authorized for.
    pub role: String,

    /// Statement text, if the configuration records it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// Extracted intent, when parsing was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<SqlIntent>,

    /// The decision.
    pub decision: Decision,

    /// Deny reason tag, `None` on allow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,

    /// Extractor that produced the intent.
    pub intent_source: String,

    /// Fingerprint of the policy the decision was made against.
    pub policy_fingerprint: String,

    /// Hash of the configuration in effect.
    pub config_hash: String,
}

impl AuditRecord {
    /// Whether the audited statement was allowed.
    #[must_use]
    pub fn allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

/// Counts over a batch of audit records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    /// Number of records.
    pub total: u32,
    /// Number of allowed statements.
    pub allowed: u32,
    /// Number of denied statements.
    pub denied: u32,
    /// Deny reason tag → count.
    pub by_reason: BTreeMap<String, u32>,
}

/// Reduce `records` to summary counts.
#[must_use]
pub fn summarize(records: &[AuditRecord]) -> AuditSummary {
    let mut summary = AuditSummary::default();
    for record in records {
        summary.total += 1;
        match record.decision.reason() {
            None => summary.allowed += 1,
            Some(reason) => {
                summary.denied += 1;
                *summary.by_reason.entry(reason.code().to_owned()).or_insert(0) += 1;
            }
        }
    }
    summary
}

/// Serialize one record to pretty-printed JSON.
///
/// # Errors
///
/// Returns an error message if serialization fails (should not happen for valid data).
pub fn to_json(record: &AuditRecord) -> Result<String, String> {
    serde_json::to_string_pretty(record).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Serialize records as JSON lines, one compact object per line.
///
/// # Errors
///
/// Returns an error message if any record fails to serialize.
pub fn to_json_lines(records: &[AuditRecord]) -> Result<String, String> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| format!("JSON serialization failed: {e}"))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
