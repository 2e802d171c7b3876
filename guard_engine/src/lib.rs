//! text2sql guard: authorization of generated SQL against role policies.
//!
//! SQL produced by a natural-language generator passes through this crate
//! before it may reach a database. The crate extracts a structured intent
//! (operation, tables, columns per table) from the text and evaluates it
//! against a table/column-level role policy, yielding a [`Decision`].
//!
//! ```
//! use text2sql_guard::{authorize, DenyReason, PolicyModel};
//!
//! let policy = PolicyModel::from_json_str(r#"{"roles": {"student": {"table_permissions": {
//!     "Students": {"allowed_operations": ["SELECT"], "allowed_columns": ["StudentID", "FullName"]}
//! }}}}"#).unwrap();
//!
//! let decision = authorize("SELECT StudentID, Email FROM Students", "student", &policy);
//! assert_eq!(decision.reason().map(DenyReason::code), Some("ColumnNotPermitted"));
//! ```
//!
//! With the `python` feature the crate also builds the `text2sql_guard`
//! Python module via PyO3.

// PyO3 macro expansion trips this lint on PyResult returns.
#![allow(clippy::useless_conversion)]

pub mod audit;
pub mod config;
mod digest;
pub mod engine;
pub mod evaluator;
pub mod intent;
pub mod policy;
#[cfg(feature = "python")]
pub mod pyo3_bindings;
pub mod types;

pub use engine::GuardEngine;
pub use evaluator::authorize;
pub use intent::extract_intent;
pub use policy::{PolicyLoadError, PolicyModel};
pub use types::{Decision, DenyReason, Operation, SqlIntent};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// The Python module exposed by this crate.
///
/// Importable as: `from text2sql_guard import Guard`
#[cfg(feature = "python")]
#[pymodule]
fn text2sql_guard(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Initialize Rust logging → Python logging bridge
    pyo3_log::init();

    pyo3_bindings::register_module(m)?;

    Ok(())
}
