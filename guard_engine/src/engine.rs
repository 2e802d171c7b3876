//! Guard engine: the main entry point for the surrounding application.
//!
//! Owns the resolved configuration, the immutable policy and the intent
//! source. All methods take `&self`; one engine can serve any number of
//! threads, and [`GuardEngine::authorize_batch`] fans out over rayon.
//!
//! Policy load failures are fatal at construction unless the configuration
//! selects `on_policy_error = "deny_all"`, in which case the engine starts with
//! an explicit empty-roles policy.

use std::path::Path;

use chrono::Utc;
use rayon::prelude::*;

use crate::audit::AuditRecord;
use crate::config::{ConfigError, GuardConfig, PolicyErrorMode};
use crate::evaluator::{evaluate, Evaluation};
use crate::intent::{IntentSource, PatternExtractor};
use crate::policy::{PolicyLoadError, PolicyModel};
use crate::types::{Decision, SqlIntent};

/// The authorization engine.
pub struct GuardEngine {
    /// The guard configuration.
    config: GuardConfig,
    /// The immutable policy every decision is made against.
    policy: PolicyModel,
    /// Produces intents from SQL text.
    source: Box<dyn IntentSource>,
    /// Cached [`GuardConfig::config_hash`].
    config_hash: String,
}

impl GuardEngine {
    /// Create an engine using the deterministic extractor.
    #[must_use]
    pub fn new(config: GuardConfig, policy: PolicyModel) -> Self {
        Self {
            config_hash: config.config_hash(),
            config,
            policy,
            source: Box::new(PatternExtractor),
        }
    }

    /// Replace the intent source.
    #[must_use]
    pub fn with_source<S: IntentSource + 'static>(mut self, source: S) -> Self {
        self.source = Box::new(source);
        self
    }

    /// Resolve configuration from `root` and load the policy it names.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if a config file is unreadable or
    /// malformed, and [`EngineError::Policy`] if the policy fails to load
    /// while `on_policy_error = "abort"`.
    pub fn from_project(root: &Path) -> Result<Self, EngineError> {
        let config = GuardConfig::load_from_project(root)?;
        let policy = load_policy(&config, root)?;
        Ok(Self::new(config, policy))
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &PolicyModel {
        &self.policy
    }

    /// Extract the intent of `sql` for logging or debugging.
    ///
    /// Falls back to the deterministic extractor if the configured source fails.
    #[must_use]
    pub fn extract_intent(&self, sql: &str) -> SqlIntent {
        self.source.extract(sql).unwrap_or_else(|e| {
            log::warn!(
                "Intent source '{}' failed ({}). Falling back to pattern extraction.",
                self.source.name(),
                e
            );
            crate::intent::extract_intent(sql)
        })
    }

    /// Authorize one statement.
    #[must_use]
    pub fn authorize(&self, sql: &str, role: &str) -> Decision {
        self.evaluate(sql, role).decision
    }

    /// Authorize one statement and build its audit record.
    ///
    /// The record is `None` when auditing is disabled.
    #[must_use]
    pub fn authorize_audited(&self, sql: &str, role: &str) -> (Decision, Option<AuditRecord>) {
        let Evaluation { decision, intent } = self.evaluate(sql, role);
        if !self.config.audit.enabled {
            return (decision, None);
        }

        let record = AuditRecord {
            timestamp: Utc::now(),
            role: role.to_owned(),
            sql: self.config.audit.include_sql.then(|| sql.to_owned()),
            intent,
            reason_code: decision.reason().map(|r| r.code().to_owned()),
            decision: decision.clone(),
            intent_source: self.source.name().to_owned(),
            policy_fingerprint: self.policy.fingerprint().to_owned(),
            config_hash: self.config_hash.clone(),
        };
        (decision, Some(record))
    }

    /// Authorize many `(sql, role)` pairs in parallel.
    ///
    /// Results are returned in input order.
    #[must_use]
    pub fn authorize_batch(&self, requests: &[(&str, &str)]) -> Vec<Decision> {
        requests
            .par_iter()
            .map(|(sql, role)| self.authorize(sql, role))
            .collect()
    }

    fn evaluate(&self, sql: &str, role: &str) -> Evaluation {
        let evaluation = evaluate(
            sql,
            role,
            &self.policy,
            self.config.denylist.as_slice(),
            &*self.source,
        );
        if let Some(reason) = evaluation.decision.reason() {
            log::info!("Denied query for role '{}': {}", role, reason);
        }
        evaluation
    }
}

/// Load the policy named by `config`, honoring `on_policy_error`.
///
/// # Errors
///
/// Returns the [`PolicyLoadError`] when the mode is
/// [`PolicyErrorMode::Abort`].
pub fn load_policy(config: &GuardConfig, root: &Path) -> Result<PolicyModel, PolicyLoadError> {
    match PolicyModel::load(&config.policy_path(root)) {
        Ok(policy) => Ok(policy),
        Err(e) => match config.on_policy_error {
            PolicyErrorMode::Abort => Err(e),
            PolicyErrorMode::DenyAll => {
                log::warn!("{}. Starting with a deny-all policy.", e);
                Ok(PolicyModel::deny_all())
            }
        },
    }
}

/// Errors raised while constructing a [`GuardEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The policy could not be loaded.
    #[error(transparent)]
    Policy(#[from] PolicyLoadError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{FallbackSource, ReplySource};
    use crate::types::DenyReason;

    const POLICY: &str = r#"{
        "roles": {
            "student": {
                "table_permissions": {
                    "Students": {
                        "allowed_operations": ["SELECT"],
                        "allowed_columns": ["StudentID", "FullName"]
                    },
                    "*": { "allowed_operations": ["SELECT"] }
                }
            }
        }
    }"#;

    fn engine() -> GuardEngine {
        GuardEngine::new(
            GuardConfig::default(),
            PolicyModel::from_json_str(POLICY).unwrap(),
        )
    }

    #[test]
    fn test_authorize() {
        let engine = engine();
        assert!(engine.authorize("SELECT FullName FROM Students", "student").is_allowed());
        assert!(!engine.authorize("SELECT Email FROM Students", "student").is_allowed());
    }

    #[test]
    fn test_configured_denylist_applies() {
        let mut config = GuardConfig::default();
        config.denylist = vec!["grades".to_owned()];
        let engine = GuardEngine::new(config, PolicyModel::from_json_str(POLICY).unwrap());
        let decision = engine.authorize("SELECT * FROM Grades", "student");
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::ForbiddenTable { term: "grades".to_owned() })
        );
        assert!(engine.authorize("SELECT * FROM Users", "student").is_allowed());
    }

    #[test]
    fn test_audited_record() {
        let engine = engine();
        let (decision, record) = engine.authorize_audited("SELECT Email FROM Students", "student");
        let record = record.unwrap();
        assert_eq!(record.decision, decision);
        assert_eq!(record.reason_code.as_deref(), Some("ColumnNotPermitted"));
        assert_eq!(record.sql.as_deref(), Some("SELECT Email FROM Students"));
        assert_eq!(record.intent.unwrap().tables, vec!["Students"]);
        assert_eq!(record.intent_source, "pattern");
        assert_eq!(record.policy_fingerprint, engine.policy().fingerprint());
        assert_eq!(record.config_hash, GuardConfig::default().config_hash());
    }

    #[test]
    fn test_audit_respects_config() {
        let mut config = GuardConfig::default();
        config.audit.include_sql = false;
        let engine = GuardEngine::new(config.clone(), PolicyModel::from_json_str(POLICY).unwrap());
        let (_, record) = engine.authorize_audited("SELECT * FROM Users", "student");
        let record = record.unwrap();
        assert!(record.sql.is_none());
        assert!(record.intent.is_none());

        config.audit.enabled = false;
        let engine = GuardEngine::new(config, PolicyModel::from_json_str(POLICY).unwrap());
        let (decision, record) = engine.authorize_audited("SELECT 1", "student");
        assert!(decision.is_allowed());
        assert!(record.is_none());
    }

    #[test]
    fn test_batch_preserves_order() {
        let engine = engine();
        let requests: Vec<(&str, &str)> = vec![
            ("SELECT FullName FROM Students", "student"),
            ("DELETE FROM Students", "student"),
            ("SELECT * FROM Courses", "student"),
            ("SELECT * FROM Courses", "teacher"),
        ];
        let decisions = engine.authorize_batch(&requests);
        let codes: Vec<Option<&str>> = decisions
            .iter()
            .map(|d| d.reason().map(DenyReason::code))
            .collect();
        assert_eq!(
            codes,
            vec![None, Some("OperationNotPermitted"), None, Some("UndefinedRole")]
        );
    }

    #[test]
    fn test_with_source_records_name() {
        let engine = engine().with_source(FallbackSource::new(ReplySource::new(|_sql: &str| {
            Err("offline".to_owned())
        })));
        let (decision, record) = engine.authorize_audited("SELECT FullName FROM Students", "student");
        assert!(decision.is_allowed());
        assert_eq!(record.unwrap().intent_source, "fallback");
        assert_eq!(
            engine.extract_intent("SELECT FullName FROM Students"),
            crate::intent::extract_intent("SELECT FullName FROM Students")
        );
    }

    #[test]
    fn test_extract_intent_survives_failing_source() {
        let engine = engine().with_source(ReplySource::new(|_sql: &str| Err("offline".to_owned())));
        let intent = engine.extract_intent("SELECT FullName FROM Students");
        assert_eq!(intent.tables, vec!["Students"]);
        assert_eq!(
            engine.authorize("SELECT FullName FROM Students", "student"),
            Decision::Deny(DenyReason::UnclassifiedOperation)
        );
    }

    #[test]
    fn test_from_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("permissions.json"), POLICY).unwrap();
        let engine = GuardEngine::from_project(dir.path()).unwrap();
        assert_eq!(engine.policy().role_names(), vec!["student"]);
    }

    #[test]
    fn test_from_project_missing_policy_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let err = GuardEngine::from_project(dir.path()).err().unwrap();
        assert!(matches!(err, EngineError::Policy(PolicyLoadError::ReadError(..))));
    }

    #[test]
    fn test_from_project_deny_all_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("text2sql_guard.toml"),
            "[guard]\non_policy_error = \"deny_all\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("permissions.json"), "{\"role\": {}}").unwrap();
        let engine = GuardEngine::from_project(dir.path()).unwrap();
        let decision = engine.authorize("SELECT FullName FROM Students", "student");
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::UndefinedRole { role: "student".to_owned() })
        );
    }
}
