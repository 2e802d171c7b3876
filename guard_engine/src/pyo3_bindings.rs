//! PyO3 bindings exposing the guard to the Python generation layer.
//!
//! The Python module is importable as:
//! ```python
//! from text2sql_guard import Guard, Decision, Intent, quick_authorize
//! ```
//!
//! Typical use after the LLM has produced SQL:
//! ```python
//! guard = Guard.from_project(".")
//! decision = guard.authorize(sql, user.role)
//! if decision.allowed:
//!     db.execute(sql)
//! else:
//!     print(decision.message)
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::audit;
use crate::config::GuardConfig;
use crate::engine::GuardEngine;
use crate::evaluator::authorize_with;
use crate::intent::{FallbackSource, ReplySource};
use crate::policy::PolicyModel;
use crate::types::{Decision, DenyReason, SqlIntent};

/// Python-facing decision.
///
/// Truthy when the statement is allowed.
#[pyclass(name = "Decision", get_all)]
#[derive(Debug, Clone)]
pub struct PyDecision {
    /// Whether the statement may be executed.
    pub allowed: bool,
    /// Deny reason tag (e.g. `"ColumnNotPermitted"`), `None` on allow.
    pub reason: Option<String>,
    /// Human-readable deny message.
    pub message: Option<String>,
    /// Offending table, when the reason names one.
    pub table: Option<String>,
    /// Offending column, for `ColumnNotPermitted`.
    pub column: Option<String>,
    /// Rejected operation, for `OperationNotPermitted`.
    pub operation: Option<String>,
}

impl From<&Decision> for PyDecision {
    fn from(decision: &Decision) -> Self {
        let mut out = Self {
            allowed: decision.is_allowed(),
            reason: None,
            message: None,
            table: None,
            column: None,
            operation: None,
        };
        if let Some(reason) = decision.reason() {
            out.reason = Some(reason.code().to_owned());
            out.message = Some(reason.to_string());
            match reason {
                DenyReason::TableNotPermitted { table } => out.table = Some(table.clone()),
                DenyReason::OperationNotPermitted { table, operation } => {
                    out.table = Some(table.clone());
                    out.operation = Some(operation.to_string());
                }
                DenyReason::ColumnNotPermitted { table, column } => {
                    out.table = Some(table.clone());
                    out.column = Some(column.clone());
                }
                _ => {}
            }
        }
        out
    }
}

#[pymethods]
impl PyDecision {
    fn __bool__(&self) -> bool {
        self.allowed
    }

    /// Return a human-readable string representation.
    fn __repr__(&self) -> String {
        match self.reason {
            None => "Decision(allowed=True)".to_owned(),
            Some(ref reason) => format!("Decision(allowed=False, reason={reason:?})"),
        }
    }
}

/// Python-facing extracted intent.
#[pyclass(name = "Intent", get_all)]
#[derive(Debug, Clone)]
pub struct PyIntent {
    /// `"SELECT"`, `"INSERT"`, `"UPDATE"`, `"DELETE"` or `None`.
    pub operation: Option<String>,
    /// Tables in order of first appearance.
    pub tables: Vec<String>,
    /// Table → attributed columns.
    pub columns_by_table: BTreeMap<String, Vec<String>>,
}

impl From<SqlIntent> for PyIntent {
    fn from(intent: SqlIntent) -> Self {
        Self {
            operation: intent.operation.map(|op| op.to_string()),
            tables: intent.tables,
            columns_by_table: intent.columns_by_table,
        }
    }
}

#[pymethods]
impl PyIntent {
    /// Return a human-readable string representation.
    fn __repr__(&self) -> String {
        format!(
            "Intent(operation={:?}, tables={:?})",
            self.operation, self.tables
        )
    }
}

/// Python-facing guard wrapper.
#[pyclass(name = "Guard")]
pub struct PyGuard {
    inner: GuardEngine,
}

#[pymethods]
impl PyGuard {
    /// Create a guard from a policy file with default configuration.
    #[new]
    fn new(policy_path: &str) -> PyResult<Self> {
        let policy = PolicyModel::load(Path::new(policy_path))
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(Self {
            inner: GuardEngine::new(GuardConfig::default(), policy),
        })
    }

    /// Resolve configuration and policy from a project directory.
    #[staticmethod]
    fn from_project(root: &str) -> PyResult<Self> {
        let inner =
            GuardEngine::from_project(Path::new(root)).map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Authorize `sql` for `role`.
    fn authorize(&self, sql: &str, role: &str) -> PyDecision {
        PyDecision::from(&self.inner.authorize(sql, role))
    }

    /// Authorize using an external parser's JSON reply as the intent.
    ///
    /// A malformed reply falls back to deterministic extraction. The reply can
    /// only narrow the decision: an allow is re-checked against the
    /// deterministic intent of `sql`.
    fn authorize_reply(&self, sql: &str, role: &str, reply: &str) -> PyDecision {
        let source = FallbackSource::new(ReplySource::new(|_sql: &str| Ok(reply.to_owned())));
        let decision = authorize_with(
            sql,
            role,
            self.inner.policy(),
            self.inner.config().denylist.as_slice(),
            &source,
        );
        PyDecision::from(&decision)
    }

    /// Extract the intent of `sql`.
    fn extract_intent(&self, sql: &str) -> PyIntent {
        PyIntent::from(self.inner.extract_intent(sql))
    }

    /// Authorize and return the audit record as JSON (`None` if auditing is off).
    fn audit_json(&self, sql: &str, role: &str) -> PyResult<Option<String>> {
        let (_, record) = self.inner.authorize_audited(sql, role);
        record
            .map(|r| audit::to_json(&r).map_err(PyValueError::new_err))
            .transpose()
    }

    /// Sorted role names defined by the policy.
    fn roles(&self) -> Vec<String> {
        self.inner
            .policy()
            .role_names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Return a human-readable string representation.
    fn __repr__(&self) -> String {
        format!(
            "Guard(roles={}, policy={})",
            self.inner.policy().role_names().len(),
            &self.inner.policy().fingerprint()[..12]
        )
    }
}

/// One-shot authorization against a JSON policy string.
///
/// # Errors
///
/// Returns a `ValueError` if the policy JSON is malformed.
#[pyfunction]
pub fn quick_authorize(sql: &str, role: &str, policy_json: &str) -> PyResult<PyDecision> {
    let policy =
        PolicyModel::from_json_str(policy_json).map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(PyDecision::from(&crate::evaluator::authorize(sql, role, &policy)))
}

/// Register all PyO3 classes and functions into the Python module.
pub fn register_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyGuard>()?;
    m.add_class::<PyDecision>()?;
    m.add_class::<PyIntent>()?;
    m.add_function(wrap_pyfunction!(quick_authorize, m)?)?;
    Ok(())
}
