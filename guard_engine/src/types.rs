//! Core type definitions for the text2sql guard.
//!
//! These types form the contract between the authorization core and the
//! surrounding generation/execution layers:
//!
//! - [`Operation`] is the leading SQL verb of a statement
//! - [`SqlIntent`] is the structured summary extracted from SQL text
//! - [`Decision`] is the outcome of a single authorization call
//! - [`DenyReason`] is the typed reason attached to every deny

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The four SQL operations a policy can grant.
///
/// Serialized as the uppercase keyword (`"SELECT"`, `"INSERT"`, ...), which is
/// also the only spelling accepted in policy documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// `SELECT ...`
    Select,
    /// `INSERT INTO ...`
    Insert,
    /// `UPDATE ... SET ...`
    Update,
    /// `DELETE FROM ...`
    Delete,
}

impl Operation {
    /// All operations in classification order.
    pub const ALL: [Operation; 4] = [
        Operation::Select,
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
    ];

    /// The uppercase SQL keyword for this operation.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Parse an operation keyword, ignoring ASCII case.
    #[must_use]
    pub fn from_keyword(word: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.keyword().eq_ignore_ascii_case(word.trim()))
    }

    /// Whether column restrictions apply to this operation.
    #[must_use]
    pub fn is_column_checked(self) -> bool {
        matches!(self, Self::Select | Self::Update)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Structured summary of a SQL statement.
///
/// Built fresh for every query and never mutated afterwards. Table names are
/// stored in canonical form (see [`crate::intent::canonical_table_name`]) but
/// every lookup against them is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlIntent {
    /// Leading operation, or `None` when the statement could not be classified.
    pub operation: Option<Operation>,

    /// Referenced tables, de-duplicated, in order of first appearance.
    pub tables: Vec<String>,

    /// Columns referenced per table. A table without an entry had no
    /// attributable columns and is not column-checked.
    pub columns_by_table: BTreeMap<String, Vec<String>>,
}

impl SqlIntent {
    /// Columns attributed to `table`, matched case-insensitively.
    #[must_use]
    pub fn columns_for(&self, table: &str) -> Option<&[String]> {
        self.columns_by_table
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, cols)| cols.as_slice())
    }
}

impl std::fmt::Display for SqlIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = self.operation.map_or("unknown", Operation::keyword);
        write!(f, "operation={op} tables=[{}]", self.tables.join(", "))?;
        for (table, cols) in &self.columns_by_table {
            write!(f, " {table}({})", cols.join(", "))?;
        }
        Ok(())
    }
}

/// Why a statement was denied.
///
/// Every variant is an ordinary, recoverable outcome: the caller reports it
/// and keeps accepting queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason")]
pub enum DenyReason {
    /// The raw text matched a denylist term.
    #[error("query text references forbidden term '{term}'")]
    ForbiddenTable {
        /// The denylist term that matched.
        term: String,
    },

    /// The role has no entry in the policy.
    #[error("role '{role}' is not defined in the policy")]
    UndefinedRole {
        /// The role that was looked up.
        role: String,
    },

    /// The statement does not start with SELECT, INSERT, UPDATE or DELETE.
    #[error("could not determine the SQL operation")]
    UnclassifiedOperation,

    /// Neither a table-specific nor a wildcard entry exists for the table.
    #[error("access to table '{table}' is not permitted")]
    TableNotPermitted {
        /// The table as extracted from the statement.
        table: String,
    },

    /// The effective permission does not list the operation.
    #[error("operation {operation} is not permitted on table '{table}'")]
    OperationNotPermitted {
        /// The table as extracted from the statement.
        table: String,
        /// The statement's operation.
        operation: Operation,
    },

    /// A referenced column is outside the effective column allow-list.
    #[error("column '{column}' of table '{table}' is not permitted")]
    ColumnNotPermitted {
        /// The table the column was attributed to.
        table: String,
        /// The column as written in the statement.
        column: String,
    },
}

impl DenyReason {
    /// Stable reason tag used in audit output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ForbiddenTable { .. } => "ForbiddenTable",
            Self::UndefinedRole { .. } => "UndefinedRole",
            Self::UnclassifiedOperation => "UnclassifiedOperation",
            Self::TableNotPermitted { .. } => "TableNotPermitted",
            Self::OperationNotPermitted { .. } => "OperationNotPermitted",
            Self::ColumnNotPermitted { .. } => "ColumnNotPermitted",
        }
    }
}

/// Outcome of one authorization call.
///
/// Only [`Decision::Allow`] may be forwarded to the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Every referenced table passed its checks.
    Allow,
    /// The first failed check.
    Deny(DenyReason),
}

impl Decision {
    /// Whether the statement may be executed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// The deny reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }

    /// Convert into a `Result` so callers can propagate denies with `?`.
    ///
    /// # Errors
    ///
    /// Returns the [`DenyReason`] when the decision is a deny.
    pub fn into_result(self) -> Result<(), DenyReason> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(reason) => Err(reason),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny(reason) => write!(f, "deny ({}): {reason}", reason.code()),
        }
    }
}
