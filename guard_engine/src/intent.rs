//! SQL intent extraction.
//!
//! Turns raw SQL text into a [`SqlIntent`] using a small, fixed set of text
//! patterns. This is NOT a SQL parser. The supported constructs are:
//!
//! - Operation: a leading `SELECT`, `INSERT`, `UPDATE` or `DELETE` keyword
//!   (case-insensitive, after leading whitespace).
//! - Tables: the identifier following `FROM`, `JOIN`, `INTO` or `UPDATE`
//!   anywhere in the text. Aliases and schema qualifiers are not resolved: in
//!   `FROM db.t` the captured table is `db`.
//! - Columns (SELECT only): the select list between the first `SELECT` and the
//!   following `FROM`, split on top-level commas. Any item containing a dot
//!   is split on its first dot and attributed to the part before it, even
//!   when that part is not a table (`COUNT(s.id)`, `price * 1.5`). Bare items
//!   are attributed only when no item was dotted and exactly one table was
//!   found.
//!
//! Subqueries, CTEs, UNIONs and multi-statement batches are outside this set.
//! Columns of INSERT/UPDATE/DELETE statements are never extracted, so column
//! restrictions do not apply to them.
//!
//! The [`IntentSource`] trait is the seam for alternative extractors (for
//! example an LLM-backed parser). Their results are untrusted: the evaluator
//! applies the denylist and every policy check to them, and then re-checks
//! the deterministic intent of the same text. An external intent can only
//! narrow a decision, never widen it.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{Operation, SqlIntent};

/// Keyword patterns that introduce a table reference.
const TABLE_PATTERNS: [&str; 4] = [
    r"(?i)\bfrom\s+([a-z_][a-z0-9_]*)",
    r"(?i)\bjoin\s+([a-z_][a-z0-9_]*)",
    r"(?i)\binto\s+([a-z_][a-z0-9_]*)",
    r"(?i)\bupdate\s+([a-z_][a-z0-9_]*)",
];

fn table_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        TABLE_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("table pattern regex is valid"))
            .collect()
    })
}

fn select_list_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)\bselect\s+(.*?)\s+from\b").expect("select list regex is valid")
    })
}

fn distinct_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^distinct\s+").expect("distinct regex is valid"))
}

// ---------------------------------------------------------------------------
// Deterministic extraction
// ---------------------------------------------------------------------------

/// Classify the statement by its leading keyword.
///
/// Returns `None` when the text does not start with one of the four
/// supported operations.
#[must_use]
pub fn classify_operation(sql: &str) -> Option<Operation> {
    let text = sql.trim_start();
    Operation::ALL.into_iter().find(|op| {
        let kw = op.keyword();
        text.get(..kw.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(kw))
    })
}

/// Canonical display form of a table name: first character uppercase, the
/// rest lowercase.
///
/// Only used for the stored form. Matching never depends on it.
#[must_use]
pub fn canonical_table_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.as_str().to_lowercase().chars())
            .collect(),
        None => String::new(),
    }
}

/// Extract referenced table names in order of first appearance.
///
/// Duplicates are removed case-insensitively; the stored form is canonical.
#[must_use]
pub fn extract_tables(sql: &str) -> Vec<String> {
    let mut hits: Vec<(usize, &str)> = Vec::new();
    for re in table_regexes() {
        for cap in re.captures_iter(sql) {
            if let Some(m) = cap.get(1) {
                hits.push((m.start(), m.as_str()));
            }
        }
    }
    hits.sort_by_key(|(offset, _)| *offset);

    let mut tables: Vec<String> = Vec::new();
    for (_, name) in hits {
        if !tables.iter().any(|t| t.eq_ignore_ascii_case(name)) {
            tables.push(canonical_table_name(name));
        }
    }
    tables
}

/// Split `list` on commas that are outside parentheses and single quotes.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth: u32 = 0;
    let mut in_quote = false;
    let mut start = 0;

    for (i, ch) in list.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            ',' if !in_quote && depth == 0 => {
                items.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&list[start..]);
    items
}

fn push_unique(bucket: &mut Vec<String>, column: &str) {
    if !bucket.iter().any(|c| c == column) {
        bucket.push(column.to_owned());
    }
}

/// Extract the columns referenced per table.
///
/// Only SELECT statements are inspected; every other operation yields an
/// empty map. `tables` must be the output of [`extract_tables`] for the same
/// text.
#[must_use]
pub fn extract_columns(
    sql: &str,
    operation: Option<Operation>,
    tables: &[String],
) -> BTreeMap<String, Vec<String>> {
    let mut columns_by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if operation != Some(Operation::Select) {
        return columns_by_table;
    }

    let Some(select_list) = select_list_regex()
        .captures(sql)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
    else {
        return columns_by_table;
    };

    let mut unqualified: Vec<String> = Vec::new();

    for raw in split_top_level(select_list) {
        let item = distinct_regex().replace(raw.trim(), "");
        let item = item.trim();
        if item.is_empty() || item == "*" {
            continue;
        }

        // Split on the first dot whatever precedes it. A bucket that names no
        // extracted table is never evaluated.
        match item.split_once('.') {
            Some((table, column)) => {
                push_unique(
                    columns_by_table
                        .entry(canonical_table_name(table.trim()))
                        .or_default(),
                    column.trim(),
                );
            }
            None => {
                if !unqualified.iter().any(|c| c == item) {
                    unqualified.push(item.to_owned());
                }
            }
        }
    }

    if !unqualified.is_empty() && columns_by_table.is_empty() && tables.len() == 1 {
        columns_by_table.insert(tables[0].clone(), unqualified);
    }

    columns_by_table
}

/// Run the full deterministic extraction on `sql`.
#[must_use]
pub fn extract_intent(sql: &str) -> SqlIntent {
    let operation = classify_operation(sql);
    let tables = extract_tables(sql);
    let columns_by_table = extract_columns(sql, operation, &tables);
    SqlIntent {
        operation,
        tables,
        columns_by_table,
    }
}

// ---------------------------------------------------------------------------
// Intent sources
// ---------------------------------------------------------------------------

/// Errors produced by non-deterministic intent sources.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    /// The reply was not a JSON object.
    #[error("intent reply is not valid JSON: {0}")]
    InvalidJson(String),

    /// The reply lacks one of `operation`, `tables`, `columns_by_table`.
    #[error("intent reply is missing required key '{0}'")]
    MissingKey(&'static str),

    /// The reply's operation is not one of the four supported keywords.
    #[error("intent reply has unrecognized operation '{0}'")]
    UnknownOperation(String),

    /// The external collaborator itself failed.
    #[error("intent source '{name}' failed: {message}")]
    Source {
        /// Name of the failing source.
        name: String,
        /// Error text reported by the source.
        message: String,
    },
}

/// Anything that can turn SQL text into a [`SqlIntent`].
///
/// Implementations must be `Send + Sync` so a single engine can authorize
/// from many threads at once.
pub trait IntentSource: Send + Sync {
    /// Short name recorded in audit output.
    fn name(&self) -> &'static str;

    /// Extract the intent of `sql`.
    ///
    /// # Errors
    ///
    /// Returns an [`IntentError`] when the source cannot produce an intent.
    fn extract(&self, sql: &str) -> Result<SqlIntent, IntentError>;

    /// Whether results always equal [`extract_intent`] on the same text.
    ///
    /// Non-deterministic sources get their allows re-checked against the
    /// pattern extractor.
    fn is_deterministic(&self) -> bool {
        false
    }
}

/// The deterministic, pattern-based extractor. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternExtractor;

impl IntentSource for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn extract(&self, sql: &str) -> Result<SqlIntent, IntentError> {
        Ok(extract_intent(sql))
    }
}

const REQUIRED_REPLY_KEYS: [&str; 3] = ["operation", "tables", "columns_by_table"];

#[derive(Debug, serde::Deserialize)]
struct IntentReply {
    operation: Option<String>,
    tables: Vec<String>,
    columns_by_table: BTreeMap<String, Vec<String>>,
}

fn strip_code_fence(reply: &str) -> &str {
    let mut text = reply.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Parse a JSON intent reply produced by an external parser.
///
/// The expected shape is
/// `{"operation": "SELECT", "tables": [...], "columns_by_table": {...}}`,
/// optionally wrapped in a markdown code fence. A `null` operation maps to an
/// unclassified intent. Table names are de-duplicated and canonicalized the
/// same way [`extract_tables`] does.
///
/// # Errors
///
/// Returns an [`IntentError`] for invalid JSON, a missing key, or an
/// operation outside the supported four.
pub fn parse_intent_reply(reply: &str) -> Result<SqlIntent, IntentError> {
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| IntentError::InvalidJson(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(IntentError::InvalidJson("expected a JSON object".to_owned()));
    };
    for key in REQUIRED_REPLY_KEYS {
        if !object.contains_key(key) {
            return Err(IntentError::MissingKey(key));
        }
    }

    let reply: IntentReply =
        serde_json::from_value(value).map_err(|e| IntentError::InvalidJson(e.to_string()))?;

    let operation = match reply.operation {
        None => None,
        Some(op) => Some(Operation::from_keyword(&op).ok_or(IntentError::UnknownOperation(op))?),
    };

    let mut tables: Vec<String> = Vec::new();
    for table in &reply.tables {
        let table = table.trim();
        if !tables.iter().any(|t| t.eq_ignore_ascii_case(table)) {
            tables.push(canonical_table_name(table));
        }
    }

    let mut columns_by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (table, columns) in reply.columns_by_table {
        let bucket = columns_by_table
            .entry(canonical_table_name(table.trim()))
            .or_default();
        for column in &columns {
            push_unique(bucket, column.trim());
        }
    }

    Ok(SqlIntent {
        operation,
        tables,
        columns_by_table,
    })
}

/// Adapts a closure that asks an external parser for a JSON intent reply.
pub struct ReplySource<F> {
    ask: F,
}

impl<F> ReplySource<F>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync,
{
    /// Wrap `ask`, which receives the SQL text and returns the raw reply.
    pub fn new(ask: F) -> Self {
        Self { ask }
    }
}

impl<F> IntentSource for ReplySource<F>
where
    F: Fn(&str) -> Result<String, String> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "reply"
    }

    fn extract(&self, sql: &str) -> Result<SqlIntent, IntentError> {
        let reply = (self.ask)(sql).map_err(|message| IntentError::Source {
            name: self.name().to_owned(),
            message,
        })?;
        parse_intent_reply(&reply)
    }
}

/// Runs a primary source and falls back to [`PatternExtractor`] on error.
pub struct FallbackSource<P> {
    primary: P,
}

impl<P: IntentSource> FallbackSource<P> {
    /// Wrap `primary` with the deterministic fallback.
    pub fn new(primary: P) -> Self {
        Self { primary }
    }
}

impl<P: IntentSource> IntentSource for FallbackSource<P> {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn extract(&self, sql: &str) -> Result<SqlIntent, IntentError> {
        match self.primary.extract(sql) {
            Ok(intent) => Ok(intent),
            Err(e) => {
                log::warn!(
                    "Intent source '{}' failed ({}). Falling back to pattern extraction.",
                    self.primary.name(),
                    e
                );
                PatternExtractor.extract(sql)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
