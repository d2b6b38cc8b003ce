//! TOML-based configuration for schemavc.
//!
//! Every section is optional and falls back to defaults, so an empty file is a
//! valid configuration. The database location can be redirected through an
//! environment variable named by `store.database_path_env`, resolved at
//! runtime via [`VcsConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Object database settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Ref naming and protection settings.
    #[serde(default)]
    pub refs: RefsConfig,

    /// Dependency traversal settings.
    #[serde(default)]
    pub dependencies: DependencyConfig,

    /// Merge behaviour settings.
    #[serde(default)]
    pub merge: MergeConfig,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where the SQLite object database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file (default `schemavc.db`).
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Environment variable that, when set, overrides `database_path`.
    #[serde(default)]
    pub database_path_env: Option<String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("schemavc.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            database_path_env: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Ref settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefsConfig {
    /// Name of the mainline branch (default `main`).
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Glob patterns naming refs that may not be deleted. The default branch
    /// is always protected, whether or not it is listed here.
    #[serde(default)]
    pub protected: Vec<String>,

    /// Regular expression every ref name must match.
    #[serde(default = "default_name_pattern")]
    pub name_pattern: String,
}

fn default_branch() -> String {
    "main".into()
}

fn default_name_pattern() -> String {
    "^[A-Za-z0-9][A-Za-z0-9._/-]*$".into()
}

impl Default for RefsConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            protected: Vec::new(),
            name_pattern: default_name_pattern(),
        }
    }
}

impl RefsConfig {
    /// All protected patterns, default branch first.
    pub fn protected_patterns(&self) -> Vec<String> {
        let mut patterns = vec![self.default_branch.clone()];
        for p in &self.protected {
            if !patterns.contains(p) {
                patterns.push(p.clone());
            }
        }
        patterns
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Dependency resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Depth bound for transitive closures (default 10).
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    10
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Move the target ref straight to the source head when the target has
    /// not changed since the merge base, instead of writing a merge commit.
    #[serde(default)]
    pub fast_forward: bool,

    /// Author recorded on merge commits when the caller does not name one.
    #[serde(default = "default_committer")]
    pub default_committer: String,
}

fn default_committer() -> String {
    "schemavc".into()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            fast_forward: false,
            default_committer: default_committer(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl VcsConfig {
    /// Load a [`VcsConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: VcsConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Apply `*_env` overrides from the environment.
    ///
    /// A referenced variable that is unset or empty logs a warning and leaves
    /// the configured value in place.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.store.database_path_env {
            if let Some(path) = resolve_optional_env(env_name, "store.database_path_env") {
                self.store.database_path = PathBuf::from(path);
            }
        }
        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "store.database_path".into(),
                detail: "database path must not be empty".into(),
            });
        }
        if self.refs.default_branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "refs.default_branch".into(),
                detail: "default branch must not be empty".into(),
            });
        }
        if let Some(p) = self.refs.protected.iter().find(|p| p.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "refs.protected".into(),
                detail: format!("empty protected pattern {:?}", p),
            });
        }
        if let Err(e) = regex_lite::Regex::new(&self.refs.name_pattern) {
            return Err(ConfigError::InvalidValue {
                field: "refs.name_pattern".into(),
                detail: e.to_string(),
            });
        }
        if self.dependencies.max_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dependencies.max_depth".into(),
                detail: "max depth must be > 0".into(),
            });
        }
        if self.merge.default_committer.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "merge.default_committer".into(),
                detail: "default committer must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
