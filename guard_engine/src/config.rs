//! Configuration loading and resolution for the text2sql guard.
//!
//! Supports a 4-level configuration resolution order:
//! 1. `text2sql_guard.toml` (project root, `[guard]` table)
//! 2. `[tool.text2sql_guard]` section in `pyproject.toml`
//! 3. `[guard]` section in `text2sql_guard.yaml` / `text2sql_guard.yml`
//! 4. Built-in defaults
//!
//! The configuration names the policy file and how a policy that fails to
//! load is handled. It never contains the policy itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::evaluator::DEFAULT_DENYLIST;

// ---------------------------------------------------------------------------
// Policy error mode
// ---------------------------------------------------------------------------

/// What to do when the policy file cannot be loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyErrorMode {
    /// Refuse to start.
    #[default]
    Abort,
    /// Start with an empty-roles policy that denies every request.
    DenyAll,
}

// ---------------------------------------------------------------------------
// Audit config
// ---------------------------------------------------------------------------

/// Configuration for decision audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit records are produced.
    pub enabled: bool,
    /// Whether records carry the SQL text.
    pub include_sql: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_sql: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Main config
// ---------------------------------------------------------------------------

/// Complete guard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Policy file path, relative to the project root unless absolute.
    pub policy_file: String,

    /// Terms that deny a statement when found anywhere in its text.
    pub denylist: Vec<String>,

    /// Behavior when the policy fails to load.
    pub on_policy_error: PolicyErrorMode,

    /// Audit record configuration.
    pub audit: AuditConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            policy_file: "permissions.json".to_owned(),
            denylist: DEFAULT_DENYLIST.iter().map(|t| (*t).to_owned()).collect(),
            on_policy_error: PolicyErrorMode::default(),
            audit: AuditConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// File deserialization helpers
// ---------------------------------------------------------------------------

/// Raw TOML structure for `text2sql_guard.toml`.
#[derive(Debug, Deserialize)]
struct GuardFile {
    guard: Option<GuardSection>,
}

/// The `[guard]` section shared by every config source.
#[derive(Debug, Deserialize)]
struct GuardSection {
    policy_file: Option<String>,
    denylist: Option<Vec<String>>,
    on_policy_error: Option<String>,
    audit: Option<AuditSection>,
}

#[derive(Debug, Deserialize)]
struct AuditSection {
    enabled: Option<bool>,
    include_sql: Option<bool>,
}

/// Raw TOML structure for `pyproject.toml` with `[tool.text2sql_guard]`.
#[derive(Debug, Deserialize)]
struct PyprojectToml {
    tool: Option<PyprojectTool>,
}

#[derive(Debug, Deserialize)]
struct PyprojectTool {
    text2sql_guard: Option<GuardSection>,
}

/// Parse an `on_policy_error` value.
fn parse_policy_error_mode(s: &str) -> Option<PolicyErrorMode> {
    match s.to_lowercase().as_str() {
        "abort" | "fail" => Some(PolicyErrorMode::Abort),
        "deny_all" | "deny-all" | "deny" => Some(PolicyErrorMode::DenyAll),
        _ => None,
    }
}

/// Apply a [`GuardSection`] onto a [`GuardConfig`], overriding any set values.
fn apply_section(config: &mut GuardConfig, section: &GuardSection) {
    if let Some(ref v) = section.policy_file {
        config.policy_file = v.clone();
    }
    if let Some(ref v) = section.denylist {
        config.denylist = v.clone();
    }
    if let Some(ref v) = section.on_policy_error {
        match parse_policy_error_mode(v) {
            Some(mode) => config.on_policy_error = mode,
            None => log::warn!("Ignoring unknown on_policy_error value '{}'", v),
        }
    }
    if let Some(ref audit) = section.audit {
        if let Some(v) = audit.enabled {
            config.audit.enabled = v;
        }
        if let Some(v) = audit.include_sql {
            config.audit.include_sql = v;
        }
    }
}

impl GuardConfig {
    /// Load configuration from the project root using the 4-level resolution order.
    ///
    /// First file found wins; later files are not consulted.
    ///
    /// # Errors
    ///
    /// Returns an error if `text2sql_guard.toml` or a YAML config file exists
    /// but cannot be read or parsed. An unparseable `pyproject.toml` is skipped.
    pub fn load_from_project(root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // 1. text2sql_guard.toml
        let guard_toml = root.join("text2sql_guard.toml");
        if guard_toml.is_file() {
            let content = read_config(&guard_toml)?;
            let parsed: GuardFile = toml::from_str(&content).map_err(|e| {
                ConfigError::ParseError(guard_toml.display().to_string(), e.to_string())
            })?;
            if let Some(ref section) = parsed.guard {
                apply_section(&mut config, section);
            }
            return Ok(config);
        }

        // 2. pyproject.toml [tool.text2sql_guard]
        let pyproject = root.join("pyproject.toml");
        if pyproject.is_file() {
            let content = read_config(&pyproject)?;
            if let Ok(parsed) = toml::from_str::<PyprojectToml>(&content) {
                if let Some(section) = parsed.tool.and_then(|t| t.text2sql_guard) {
                    apply_section(&mut config, &section);
                    return Ok(config);
                }
            }
        }

        // 3. text2sql_guard.yaml / .yml
        for name in &["text2sql_guard.yaml", "text2sql_guard.yml"] {
            let yaml_path = root.join(name);
            if yaml_path.is_file() {
                let content = read_config(&yaml_path)?;
                let parsed: GuardFile = serde_yaml::from_str(&content).map_err(|e| {
                    ConfigError::ParseError(yaml_path.display().to_string(), e.to_string())
                })?;
                if let Some(ref section) = parsed.guard {
                    apply_section(&mut config, section);
                }
                return Ok(config);
            }
        }

        // 4. Built-in defaults (already set)
        Ok(config)
    }

    /// Absolute path of the policy file for a project rooted at `root`.
    #[must_use]
    pub fn policy_path(&self, root: &Path) -> PathBuf {
        let path = Path::new(&self.policy_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }

    /// SHA-256 hash identifying this configuration in audit output.
    #[must_use]
    pub fn config_hash(&self) -> String {
        crate::digest::fingerprint(self)
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.display().to_string(), e.to_string()))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file '{0}': {1}")]
    ReadError(String, String),

    /// Failed to parse a configuration file.
    #[error("Failed to parse config file '{0}': {1}")]
    ParseError(String, String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GuardConfig::default();
        assert_eq!(config.policy_file, "permissions.json");
        assert_eq!(config.denylist, vec!["users"]);
        assert_eq!(config.on_policy_error, PolicyErrorMode::Abort);
        assert!(config.audit.enabled);
        assert!(config.audit.include_sql);
    }

    #[test]
    fn test_parse_policy_error_mode() {
        assert_eq!(parse_policy_error_mode("abort"), Some(PolicyErrorMode::Abort));
        assert_eq!(parse_policy_error_mode("DENY_ALL"), Some(PolicyErrorMode::DenyAll));
        assert_eq!(parse_policy_error_mode("deny-all"), Some(PolicyErrorMode::DenyAll));
        assert_eq!(parse_policy_error_mode("allow_all"), None);
    }

    #[test]
    fn test_config_hash_changes_with_denylist() {
        let config1 = GuardConfig::default();
        let mut config2 = GuardConfig::default();
        config2.denylist.push("salaries".to_owned());
        assert_ne!(config1.config_hash(), config2.config_hash());
        assert_eq!(config1.config_hash(), GuardConfig::default().config_hash());
    }

    #[test]
    fn test_load_nonexistent_dir() {
        let config = GuardConfig::load_from_project(Path::new("/nonexistent/path")).unwrap();
        assert_eq!(config, GuardConfig::default());
    }

    #[test]
    fn test_policy_path_relative_and_absolute() {
        let mut config = GuardConfig::default();
        assert_eq!(
            config.policy_path(Path::new("/srv/app")),
            PathBuf::from("/srv/app/permissions.json")
        );
        config.policy_file = "/etc/guard/policy.yaml".to_owned();
        assert_eq!(
            config.policy_path(Path::new("/srv/app")),
            PathBuf::from("/etc/guard/policy.yaml")
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let toml_content = r#"
[guard]
policy_file = "config/permissions2.json"
denylist = ["users", "passwords"]
on_policy_error = "deny_all"

[guard.audit]
include_sql = false
"#;
        std::fs::write(dir.path().join("text2sql_guard.toml"), toml_content).unwrap();
        let config = GuardConfig::load_from_project(dir.path()).unwrap();
        assert_eq!(config.policy_file, "config/permissions2.json");
        assert_eq!(config.denylist, vec!["users", "passwords"]);
        assert_eq!(config.on_policy_error, PolicyErrorMode::DenyAll);
        assert!(config.audit.enabled);
        assert!(!config.audit.include_sql);
    }

    #[test]
    fn test_load_from_pyproject_toml() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"
[project]
name = "school-assistant"

[tool.text2sql_guard]
policy_file = "perms.yaml"
"#;
        std::fs::write(dir.path().join("pyproject.toml"), content).unwrap();
        let config = GuardConfig::load_from_project(dir.path()).unwrap();
        assert_eq!(config.policy_file, "perms.yaml");
        assert_eq!(config.denylist, vec!["users"]);
    }

    #[test]
    fn test_pyproject_without_section_falls_through_to_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"x\"\n").unwrap();
        std::fs::write(
            dir.path().join("text2sql_guard.yml"),
            "guard:\n  audit:\n    enabled: false\n",
        )
        .unwrap();
        let config = GuardConfig::load_from_project(dir.path()).unwrap();
        assert!(!config.audit.enabled);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("text2sql_guard.toml"), "[guard\n").unwrap();
        let err = GuardConfig::load_from_project(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
    }
}
