//! Ticket identifier extraction from branch names.
//!
//! Branch naming conventions like `feature/ENG-123-fix-login` embed the
//! tracking-ticket identifier directly in the branch name. This module
//! compiles a configurable grammar into a matcher that pulls the
//! identifier back out. Extraction is pure: no I/O, deterministic.

use regex::Regex;

use crate::error::{BranchLinkError, Result};

/// Default ticket-id grammar: one or more letters, a hyphen, one or more
/// digits (e.g. `ENG-123`).
pub const DEFAULT_GRAMMAR: &str = "[A-Za-z]+-[0-9]+";

/// Compiled ticket-id matcher.
///
/// Matches case-insensitively anywhere in the branch name; the leftmost
/// match wins and the result is normalized to uppercase.
///
/// # Example
///
/// ```rust,ignore
/// let pattern = TicketPattern::default_grammar();
/// assert_eq!(
///     pattern.extract("feature/ENG-123-fix-login"),
///     Some("ENG-123".to_string())
/// );
/// ```
#[derive(Debug, Clone)]
pub struct TicketPattern {
    grammar: String,
    regex: Regex,
}

impl TicketPattern {
    /// Compile a ticket-id grammar.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the grammar is empty or is not a
    /// valid regular expression.
    pub fn new(grammar: &str) -> Result<Self> {
        if grammar.trim().is_empty() {
            return Err(BranchLinkError::validation(
                "pattern grammar",
                "must not be empty",
            ));
        }

        let regex = Regex::new(&format!("(?i){grammar}")).map_err(|e| {
            BranchLinkError::validation("pattern grammar", format!("invalid regex: {e}"))
        })?;

        Ok(Self {
            grammar: grammar.to_string(),
            regex,
        })
    }

    /// Compile the default grammar.
    ///
    /// The default grammar is a compile-checked constant, so this cannot
    /// fail.
    #[must_use]
    pub fn default_grammar() -> Self {
        Self::new(DEFAULT_GRAMMAR).expect("default grammar must compile")
    }

    /// The grammar string this matcher was compiled from.
    #[must_use]
    pub fn grammar(&self) -> &str {
        &self.grammar
    }

    /// Extract a ticket identifier from a branch name.
    ///
    /// Returns the leftmost match normalized to uppercase, or `None`
    /// when the branch name contains no ticket identifier.
    #[must_use]
    pub fn extract(&self, branch_name: &str) -> Option<String> {
        self.regex
            .find(branch_name)
            .map(|m| m.as_str().to_uppercase())
    }
}
