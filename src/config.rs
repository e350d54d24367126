//! Configuration for the association manager.
//!
//! Configuration is optional: every field has a default, and a missing
//! `branchlink.toml` simply yields [`ManagerConfig::default`]. Loaded
//! values are validated before any component touches I/O.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BranchLinkError, Result};
use crate::pattern::{TicketPattern, DEFAULT_GRAMMAR};

/// Config file name, looked up in the workspace root.
pub const CONFIG_FILE: &str = "branchlink.toml";

/// Default age in days after which an unused association is flagged.
pub const DEFAULT_OLD_AFTER_DAYS: u32 = 30;

/// Default number of changed files shown in a checkout-conflict summary.
pub const DEFAULT_CHANGED_FILES_SHOWN: usize = 5;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Ticket-id extraction settings.
    #[serde(default)]
    pub pattern: PatternConfig,

    /// Age and display thresholds.
    #[serde(default)]
    pub thresholds: ThresholdConfig,
}

/// Ticket-id extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PatternConfig {
    /// Regex grammar for ticket identifiers embedded in branch names.
    #[serde(default = "default_grammar")]
    pub grammar: String,
}

/// Age and display thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThresholdConfig {
    /// Days without use after which an association counts as old.
    #[serde(default = "default_old_after_days")]
    pub old_after_days: u32,

    /// Display cap for the uncommitted-changes summary.
    #[serde(default = "default_changed_files_shown")]
    pub changed_files_shown: usize,
}

fn default_grammar() -> String {
    DEFAULT_GRAMMAR.to_string()
}

fn default_old_after_days() -> u32 {
    DEFAULT_OLD_AFTER_DAYS
}

fn default_changed_files_shown() -> usize {
    DEFAULT_CHANGED_FILES_SHOWN
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            grammar: default_grammar(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            old_after_days: default_old_after_days(),
            changed_files_shown: default_changed_files_shown(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from `branchlink.toml` in the given directory.
    ///
    /// A missing file yields the defaults. A present file must parse and
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the file cannot be read, is not
    /// valid TOML, or contains out-of-range values.
    pub fn load(workspace_dir: impl AsRef<Path>) -> Result<Self> {
        let path = workspace_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            BranchLinkError::validation("config", format!("cannot read {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&raw).map_err(|e| {
            BranchLinkError::validation("config", format!("cannot parse {}: {e}", path.display()))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all fields, rejecting malformed values before any I/O.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        // Compiling the grammar is the only meaningful validity check for it.
        TicketPattern::new(&self.pattern.grammar)?;

        if self.thresholds.old_after_days == 0 {
            return Err(BranchLinkError::validation(
                "thresholds.old_after_days",
                "must be at least 1",
            ));
        }

        if self.thresholds.changed_files_shown == 0 {
            return Err(BranchLinkError::validation(
                "thresholds.changed_files_shown",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Compile the configured ticket-id grammar.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the grammar does not compile.
    pub fn compile_pattern(&self) -> Result<TicketPattern> {
        TicketPattern::new(&self.pattern.grammar)
    }
}
