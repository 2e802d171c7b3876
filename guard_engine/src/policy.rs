//! Role policy model.
//!
//! A policy maps role names to per-table permissions:
//!
//! ```json
//! {
//!   "roles": {
//!     "student": {
//!       "table_permissions": {
//!         "Students": { "allowed_operations": ["SELECT"], "allowed_columns": ["StudentID"] },
//!         "*":        { "allowed_operations": ["SELECT"] }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Role names are matched exactly. Table keys are matched ignoring ASCII case;
//! the `"*"` key is the wildcard entry, consulted only when no table-specific
//! entry matches. An empty or absent `allowed_columns` means no column
//! restriction.
//!
//! A [`PolicyModel`] is validated once and never mutated, so it can be shared
//! across threads without locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::Operation;

/// Table key that applies to every table without a specific entry.
pub const WILDCARD_TABLE: &str = "*";

// ---------------------------------------------------------------------------
// Document types (serde shape of the configuration)
// ---------------------------------------------------------------------------

/// The policy document as supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Role name → role policy.
    pub roles: BTreeMap<String, RoleDocument>,
}

/// One role's entry in the policy document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleDocument {
    /// Table name (or `"*"`) → permission.
    #[serde(default)]
    pub table_permissions: BTreeMap<String, TablePermission>,
}

/// What a role may do with one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TablePermission {
    /// Operations the role may run against the table.
    #[serde(default)]
    pub allowed_operations: BTreeSet<Operation>,

    /// Columns the role may reference. Empty means unrestricted.
    #[serde(default)]
    pub allowed_columns: Vec<String>,
}

impl TablePermission {
    /// Whether `operation` is granted.
    #[must_use]
    pub fn allows_operation(&self, operation: Operation) -> bool {
        self.allowed_operations.contains(&operation)
    }

    /// Whether a column allow-list is in force.
    #[must_use]
    pub fn restricts_columns(&self) -> bool {
        !self.allowed_columns.is_empty()
    }

    /// Whether `column` is on the allow-list, ignoring ASCII case.
    #[must_use]
    pub fn allows_column(&self, column: &str) -> bool {
        self.allowed_columns
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(column))
    }
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// One role's permissions, indexed for case-insensitive table lookup.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    /// Lowercased table name → permission.
    tables: HashMap<String, TablePermission>,
    /// The `"*"` entry, if any.
    wildcard: Option<TablePermission>,
}

impl RolePolicy {
    /// The table-specific entry for `table`, ignoring ASCII case.
    #[must_use]
    pub fn specific(&self, table: &str) -> Option<&TablePermission> {
        self.tables.get(&table.to_ascii_lowercase())
    }

    /// The wildcard entry, if the role has one.
    #[must_use]
    pub fn wildcard(&self) -> Option<&TablePermission> {
        self.wildcard.as_ref()
    }

    /// The effective permission for `table`: its specific entry, else the
    /// wildcard entry.
    #[must_use]
    pub fn effective(&self, table: &str) -> Option<&TablePermission> {
        self.specific(table).or(self.wildcard.as_ref())
    }
}

/// Immutable role → table → permission model.
#[derive(Debug, Clone)]
pub struct PolicyModel {
    roles: HashMap<String, RolePolicy>,
    fingerprint: String,
}

impl PolicyModel {
    /// Validate a policy document and index it.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyLoadError::EmptyRoleName`] for a blank role name and
    /// [`PolicyLoadError::DuplicateTable`] when two table keys of one role
    /// differ only in case.
    pub fn from_document(document: PolicyDocument) -> Result<Self, PolicyLoadError> {
        let fingerprint = crate::digest::fingerprint(&document);
        let mut roles = HashMap::with_capacity(document.roles.len());

        for (role, role_doc) in document.roles {
            if role.trim().is_empty() {
                return Err(PolicyLoadError::EmptyRoleName);
            }

            let mut policy = RolePolicy::default();
            for (table, permission) in role_doc.table_permissions {
                if table == WILDCARD_TABLE {
                    policy.wildcard = Some(permission);
                    continue;
                }
                let key = table.to_ascii_lowercase();
                if policy.tables.contains_key(&key) {
                    return Err(PolicyLoadError::DuplicateTable { role, table });
                }
                policy.tables.insert(key, permission);
            }
            roles.insert(role, policy);
        }

        log::info!(
            "Loaded access policy with {} role(s), fingerprint {}",
            roles.len(),
            fingerprint
        );
        Ok(Self { roles, fingerprint })
    }

    /// Build from an already-parsed configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyLoadError::ParseError`] when the value does not have
    /// the policy shape (including a missing `roles` key), or any validation
    /// error from [`PolicyModel::from_document`].
    pub fn from_value(value: serde_json::Value) -> Result<Self, PolicyLoadError> {
        let document: PolicyDocument = serde_json::from_value(value)
            .map_err(|e| PolicyLoadError::ParseError("<value>".to_owned(), e.to_string()))?;
        Self::from_document(document)
    }

    /// Build from JSON text.
    ///
    /// # Errors
    ///
    /// See [`PolicyModel::from_value`].
    pub fn from_json_str(text: &str) -> Result<Self, PolicyLoadError> {
        let document: PolicyDocument = serde_json::from_str(text)
            .map_err(|e| PolicyLoadError::ParseError("<json>".to_owned(), e.to_string()))?;
        Self::from_document(document)
    }

    /// Build from YAML text.
    ///
    /// # Errors
    ///
    /// See [`PolicyModel::from_value`].
    pub fn from_yaml_str(text: &str) -> Result<Self, PolicyLoadError> {
        let document: PolicyDocument = serde_yaml::from_str(text)
            .map_err(|e| PolicyLoadError::ParseError("<yaml>".to_owned(), e.to_string()))?;
        Self::from_document(document)
    }

    /// Load a policy file. `.yaml`/`.yml` files are parsed as YAML, anything
    /// else as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyLoadError::ReadError`] if the file cannot be read, or
    /// a parse/validation error naming the file.
    pub fn load(path: &Path) -> Result<Self, PolicyLoadError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PolicyLoadError::ReadError(display.clone(), e.to_string()))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        let document: PolicyDocument = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| PolicyLoadError::ParseError(display, e.to_string()))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| PolicyLoadError::ParseError(display, e.to_string()))?
        };
        Self::from_document(document)
    }

    /// A policy with no roles: every authorization is denied.
    #[must_use]
    pub fn deny_all() -> Self {
        let document = PolicyDocument::default();
        Self {
            fingerprint: crate::digest::fingerprint(&document),
            roles: HashMap::new(),
        }
    }

    /// The policy for `role`, matched exactly.
    #[must_use]
    pub fn role(&self, role: &str) -> Option<&RolePolicy> {
        self.roles.get(role)
    }

    /// Sorted role names.
    #[must_use]
    pub fn role_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// SHA-256 fingerprint of the source document.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a policy. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    /// Failed to read a policy file.
    #[error("Failed to read policy file '{0}': {1}")]
    ReadError(String, String),

    /// The policy does not have the expected shape.
    #[error("Failed to parse policy '{0}': {1}")]
    ParseError(String, String),

    /// Two table keys of one role differ only in case.
    #[error("Role '{role}' defines table '{table}' more than once (keys differ only in case)")]
    DuplicateTable {
        /// Role containing the duplicate.
        role: String,
        /// The second key seen.
        table: String,
    },

    /// A role name is empty or whitespace.
    #[error("Policy contains an empty role name")]
    EmptyRoleName,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use serde_json::json;

    fn sample() -> PolicyModel {
        PolicyModel::from_value(json!({
            "roles": {
                "student": {
                    "table_permissions": {
                        "Students": {
                            "allowed_operations": ["SELECT"],
                            "allowed_columns": ["StudentID", "FullName"]
                        },
                        "*": { "allowed_operations": ["SELECT"] }
                    }
                },
                "teacher": {
                    "table_permissions": {
                        "Grades": { "allowed_operations": ["SELECT", "UPDATE"] }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_case_insensitive() {
        let policy = sample();
        let student = policy.role("student").unwrap();
        assert!(student.specific("students").is_some());
        assert!(student.specific("STUDENTS").is_some());
        assert!(student.specific("Courses").is_none());
    }

    #[test]
    fn test_wildcard_only_when_no_specific_entry() {
        let policy = sample();
        let student = policy.role("student").unwrap();
        assert!(student.effective("Students").unwrap().restricts_columns());
        let courses = student.effective("Courses").unwrap();
        assert!(!courses.restricts_columns());
        assert!(courses.allows_operation(Operation::Select));
    }

    #[test]
    fn test_no_wildcard() {
        let policy = sample();
        let teacher = policy.role("teacher").unwrap();
        assert!(teacher.wildcard().is_none());
        assert!(teacher.effective("Students").is_none());
    }

    #[test]
    fn test_role_lookup_is_exact() {
        let policy = sample();
        assert!(policy.role("student").is_some());
        assert!(policy.role("Student").is_none());
        assert_eq!(policy.role_names(), vec!["student", "teacher"]);
    }

    #[test]
    fn test_allows_column_case_insensitive() {
        let perm = TablePermission {
            allowed_operations: BTreeSet::from([Operation::Select]),
            allowed_columns: vec!["FullName".to_owned()],
        };
        assert!(perm.allows_column("fullname"));
        assert!(!perm.allows_column("Email"));
    }

    #[test]
    fn test_missing_roles_key() {
        let err = PolicyModel::from_value(json!({ "role": {} })).unwrap_err();
        assert!(matches!(err, PolicyLoadError::ParseError(..)));
    }

    #[test]
    fn test_malformed_operation() {
        let err = PolicyModel::from_json_str(
            r#"{"roles": {"r": {"table_permissions": {"T": {"allowed_operations": ["DROP"]}}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyLoadError::ParseError(..)));
    }

    #[test]
    fn test_wrong_entry_shape() {
        let err = PolicyModel::from_value(json!({
            "roles": { "r": { "table_permissions": { "T": "SELECT" } } }
        }))
        .unwrap_err();
        assert!(matches!(err, PolicyLoadError::ParseError(..)));
    }

    #[test]
    fn test_duplicate_table_keys_rejected() {
        let err = PolicyModel::from_value(json!({
            "roles": { "r": { "table_permissions": {
                "Students": { "allowed_operations": ["SELECT"] },
                "students": { "allowed_operations": ["DELETE"] }
            } } }
        }))
        .unwrap_err();
        assert!(matches!(err, PolicyLoadError::DuplicateTable { .. }));
    }

    #[test]
    fn test_empty_role_name_rejected() {
        let err = PolicyModel::from_value(json!({ "roles": { " ": {} } })).unwrap_err();
        assert!(matches!(err, PolicyLoadError::EmptyRoleName));
    }

    #[test]
    fn test_absent_fields_default_empty() {
        let policy = PolicyModel::from_value(json!({
            "roles": { "guest": {}, "reader": { "table_permissions": { "T": {} } } }
        }))
        .unwrap();
        assert!(policy.role("guest").unwrap().effective("T").is_none());
        let perm = policy.role("reader").unwrap().effective("t").unwrap();
        assert!(perm.allowed_operations.is_empty());
        assert!(!perm.restricts_columns());
    }

    #[test]
    fn test_deny_all_has_no_roles() {
        let policy = PolicyModel::deny_all();
        assert!(policy.role_names().is_empty());
        assert_eq!(policy.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
        assert_ne!(sample().fingerprint(), PolicyModel::deny_all().fingerprint());
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        std::fs::write(
            &path,
            r#"{"roles": {"student": {"table_permissions": {"Students": {"allowed_operations": ["SELECT"]}}}}}"#,
        )
        .unwrap();
        let policy = PolicyModel::load(&path).unwrap();
        assert!(policy.role("student").is_some());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.yaml");
        let content = indoc! {r#"
            roles:
              teacher:
                table_permissions:
                  Classes:
                    allowed_operations: [SELECT, UPDATE]
                    allowed_columns: [ClassID, Semester]
        "#};
        std::fs::write(&path, content).unwrap();
        let policy = PolicyModel::load(&path).unwrap();
        let classes = policy.role("teacher").unwrap().effective("classes").unwrap();
        assert!(classes.allows_operation(Operation::Update));
        assert!(classes.allows_column("semester"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PolicyModel::load(Path::new("/nonexistent/permissions.json")).unwrap_err();
        assert!(matches!(err, PolicyLoadError::ReadError(..)));
    }
}
