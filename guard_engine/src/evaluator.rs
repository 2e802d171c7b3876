//! Permission evaluation.
//!
//! [`authorize`] decides whether a role may run a SQL statement. The checks
//! run in a fixed order and stop at the first failure:
//!
//! 1. Denylist: any denylist term occurring in the raw text, ignoring case,
//!    denies before parsing.
//! 2. The role must exist in the policy.
//! 3. The statement must classify as SELECT, INSERT, UPDATE or DELETE.
//! 4. For each table, in order of first appearance in the text:
//!    an effective permission must exist, it must grant the operation, and
//!    for SELECT/UPDATE under a column allow-list every attributed column
//!    must be listed. `*` and function-call items are not column-checked.
//!    A table with no attributed columns (e.g. `SELECT *`) skips the column
//!    check entirely.
//! 5. When the intent came from a non-deterministic source and passed, the
//!    deterministic intent of the same text must pass step 3 and 4 too.
//!
//! Everything here is a pure function of its inputs: no I/O, no locks, no
//! shared mutable state.

use memchr::memmem;

use crate::intent::{extract_intent, IntentSource, PatternExtractor};
use crate::policy::{PolicyModel, RolePolicy};
use crate::types::{Decision, DenyReason, SqlIntent};

/// Terms whose presence anywhere in the SQL text denies the statement.
pub const DEFAULT_DENYLIST: &[&str] = &["users"];

/// A decision together with the intent it was based on.
///
/// `intent` is `None` when the statement was denied before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// The authorization outcome.
    pub decision: Decision,
    /// The extracted intent, when parsing was reached.
    pub intent: Option<SqlIntent>,
}

/// Authorize `sql` for `role` with the default denylist and the
/// deterministic extractor.
#[must_use]
pub fn authorize(sql: &str, role: &str, policy: &PolicyModel) -> Decision {
    evaluate(sql, role, policy, DEFAULT_DENYLIST, &PatternExtractor).decision
}

/// Authorize with a custom denylist and intent source.
#[must_use]
pub fn authorize_with<S: AsRef<str>>(
    sql: &str,
    role: &str,
    policy: &PolicyModel,
    denylist: &[S],
    source: &dyn IntentSource,
) -> Decision {
    evaluate(sql, role, policy, denylist, source).decision
}

/// Run the full decision procedure and keep the intent for auditing.
#[must_use]
pub fn evaluate<S: AsRef<str>>(
    sql: &str,
    role: &str,
    policy: &PolicyModel,
    denylist: &[S],
    source: &dyn IntentSource,
) -> Evaluation {
    if let Some(term) = find_denylisted(sql, denylist) {
        return Evaluation {
            decision: Decision::Deny(DenyReason::ForbiddenTable {
                term: term.to_owned(),
            }),
            intent: None,
        };
    }

    let Some(role_policy) = policy.role(role) else {
        return Evaluation {
            decision: Decision::Deny(DenyReason::UndefinedRole {
                role: role.to_owned(),
            }),
            intent: None,
        };
    };

    let intent = match source.extract(sql) {
        Ok(intent) => intent,
        Err(e) => {
            log::warn!("Intent source '{}' failed: {}", source.name(), e);
            return Evaluation {
                decision: Decision::Deny(DenyReason::UnclassifiedOperation),
                intent: None,
            };
        }
    };
    log::debug!("Parsed intent for role '{}': {}", role, intent);

    let mut decision = evaluate_intent(&intent, role_policy);
    if decision.is_allowed() && !source.is_deterministic() {
        decision = evaluate_intent(&extract_intent(sql), role_policy);
        if let Some(reason) = decision.reason() {
            log::warn!(
                "Intent from source '{}' allowed a query the pattern extractor denies: {}",
                source.name(),
                reason
            );
        }
    }

    Evaluation {
        decision,
        intent: Some(intent),
    }
}

/// Evaluate an extracted intent against one role's permissions.
///
/// Covers steps 3 and 4 of the decision procedure; the denylist, role
/// lookup and the deterministic re-check are the caller's responsibility.
#[must_use]
pub fn evaluate_intent(intent: &SqlIntent, role: &RolePolicy) -> Decision {
    let Some(operation) = intent.operation else {
        return Decision::Deny(DenyReason::UnclassifiedOperation);
    };

    for table in &intent.tables {
        let Some(permission) = role.effective(table) else {
            return Decision::Deny(DenyReason::TableNotPermitted {
                table: table.clone(),
            });
        };

        if !permission.allows_operation(operation) {
            return Decision::Deny(DenyReason::OperationNotPermitted {
                table: table.clone(),
                operation,
            });
        }

        if !(permission.restricts_columns() && operation.is_column_checked()) {
            continue;
        }

        // No attributed columns means no column check for this table.
        let Some(columns) = intent.columns_for(table) else {
            continue;
        };
        for column in columns {
            if column == "*" || column.contains('(') {
                continue;
            }
            if !permission.allows_column(column) {
                return Decision::Deny(DenyReason::ColumnNotPermitted {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    Decision::Allow
}

/// The first denylist term occurring in `sql`, ignoring ASCII case.
///
/// Empty terms never match.
#[must_use]
pub fn find_denylisted<'a, S: AsRef<str>>(sql: &str, denylist: &'a [S]) -> Option<&'a str> {
    let haystack = sql.to_ascii_lowercase();
    for term in denylist {
        let term: &str = term.as_ref();
        if term.is_empty() {
            continue;
        }
        if memmem::find(haystack.as_bytes(), term.to_ascii_lowercase().as_bytes()).is_some() {
            return Some(term);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
