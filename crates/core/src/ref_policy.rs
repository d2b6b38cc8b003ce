//! Ref-name and ref-protection policy.
//!
//! Provides [`RefPolicy`] which encapsulates the `name_pattern` and
//! `protected` settings from [`RefsConfig`] and evaluates ref names before
//! they are created or deleted.
//!
//! # Decision model
//!
//! For each delete request the policy returns a [`RefPolicyDecision`]:
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Name matches a protected glob | `Protected` |
//! | Otherwise | `Allow` |
//!
//! Names are validated separately by [`RefPolicy::validate_name`].

use regex_lite::Regex;
use tracing::debug;

use crate::config::RefsConfig;
use crate::errors::{ConfigError, RefError};

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a ref deletion against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefPolicyDecision {
    /// The ref may be deleted.
    Allow,
    /// The ref matches a protected pattern.
    Protected { pattern: String },
}

impl RefPolicyDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Protected { .. })
    }

    /// Short label for audit/logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Protected { .. } => "protected",
        }
    }
}

// ---------------------------------------------------------------------------
// RefPolicy
// ---------------------------------------------------------------------------

/// Validates ref names and guards protected refs.
#[derive(Debug, Clone)]
pub struct RefPolicy {
    name_pattern: Regex,
    /// Glob patterns matched against the full ref name.
    protected: Vec<String>,
}

impl RefPolicy {
    /// Build a policy from a name regex and protected glob patterns.
    pub fn new(name_pattern: &str, protected: Vec<String>) -> Result<Self, ConfigError> {
        let name_pattern = Regex::new(name_pattern).map_err(|e| ConfigError::InvalidValue {
            field: "refs.name_pattern".into(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            name_pattern,
            protected,
        })
    }

    /// Build the policy for a `[refs]` config section. The default branch is
    /// always protected.
    pub fn from_config(refs: &RefsConfig) -> Result<Self, ConfigError> {
        Self::new(&refs.name_pattern, refs.protected_patterns())
    }

    /// Check that `name` is an acceptable ref name.
    pub fn validate_name(&self, name: &str) -> Result<(), RefError> {
        let invalid = |detail: &str| RefError::InvalidName {
            name: name.to_string(),
            detail: detail.to_string(),
        };
        if !self.name_pattern.is_match(name) {
            return Err(invalid("must match the configured ref name pattern"));
        }
        if name.contains("..") {
            return Err(invalid("must not contain '..'"));
        }
        if name.ends_with('/') {
            return Err(invalid("must not end with '/'"));
        }
        if name.ends_with(".lock") {
            return Err(invalid("must not end with '.lock'"));
        }
        Ok(())
    }

    /// Evaluate a delete of `name`.
    pub fn evaluate_delete(&self, name: &str) -> RefPolicyDecision {
        for pattern in &self.protected {
            if glob_match::glob_match(pattern, name) {
                debug!(name, pattern = pattern.as_str(), "ref matches protected pattern");
                return RefPolicyDecision::Protected {
                    pattern: pattern.clone(),
                };
            }
        }
        RefPolicyDecision::Allow
    }

    pub fn protected_patterns(&self) -> &[String] {
        &self.protected
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
