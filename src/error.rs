//! Custom error types for branchlink.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the crate.

use thiserror::Error;

/// Main error type for branchlink operations
#[derive(Error, Debug)]
pub enum BranchLinkError {
    // =========================================================================
    // Git Errors
    // =========================================================================
    /// Git subprocess failed or the workspace is not a repository
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Referenced branch does not exist locally
    #[error("Branch not found: {branch}")]
    BranchNotFound { branch: String },

    /// Checkout refused because the working tree has uncommitted changes
    #[error("Checkout of '{branch}' blocked by {dirty_files} uncommitted file(s)")]
    CheckoutConflict { branch: String, dirty_files: usize },

    // =========================================================================
    // Association Errors
    // =========================================================================
    /// Ticket has no active branch association
    #[error("No branch associated with ticket {ticket_id}")]
    NotAssociated { ticket_id: String },

    /// Ticket is associated with a branch that no longer exists locally
    #[error("Association for {ticket_id} is stale: branch '{branch}' no longer exists")]
    StaleAssociation { ticket_id: String, branch: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Persistence substrate failed after the retry budget was exhausted
    #[error("Store I/O error: {message}")]
    StoreIo { message: String },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Malformed or empty input, rejected before any I/O
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BranchLinkError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a branch-not-found error
    pub fn branch_not_found(branch: impl Into<String>) -> Self {
        Self::BranchNotFound {
            branch: branch.into(),
        }
    }

    /// Create a not-associated error
    pub fn not_associated(ticket_id: impl Into<String>) -> Self {
        Self::NotAssociated {
            ticket_id: ticket_id.into(),
        }
    }

    /// Create a stale-association error
    pub fn stale_association(ticket_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self::StaleAssociation {
            ticket_id: ticket_id.into(),
            branch: branch.into(),
        }
    }

    /// Create a store I/O error
    pub fn store_io(message: impl Into<String>) -> Self {
        Self::StoreIo {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable by the caller without
    /// abandoning the workflow (typically by cleaning up or re-associating).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BranchNotFound { .. }
                | Self::NotAssociated { .. }
                | Self::StaleAssociation { .. }
                | Self::CheckoutConflict { .. }
                | Self::Validation { .. }
        )
    }

    /// Check if this error must be resolved by an explicit user decision
    /// rather than automatic handling.
    pub fn requires_decision(&self) -> bool {
        matches!(self, Self::CheckoutConflict { .. })
    }

    /// Check if this error is fatal for the current operation
    /// (no retry, surface immediately).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Git { .. } | Self::StoreIo { .. } | Self::Io(_) | Self::Json(_) | Self::Other(_)
        )
    }
}

/// Type alias for branchlink results
pub type Result<T> = std::result::Result<T, BranchLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BranchLinkError::stale_association("ENG-1", "feat/a");
        assert!(err.to_string().contains("ENG-1"));
        assert!(err.to_string().contains("feat/a"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(BranchLinkError::branch_not_found("feat/a").is_recoverable());
        assert!(BranchLinkError::not_associated("ENG-1").is_recoverable());
        assert!(!BranchLinkError::git("checkout", "boom").is_recoverable());
        assert!(!BranchLinkError::store_io("disk full").is_recoverable());
    }

    #[test]
    fn test_requires_decision() {
        let err = BranchLinkError::CheckoutConflict {
            branch: "feat/a".into(),
            dirty_files: 3,
        };
        assert!(err.requires_decision());
        assert!(!BranchLinkError::branch_not_found("feat/a").requires_decision());
    }

    #[test]
    fn test_is_fatal() {
        assert!(BranchLinkError::git("status", "not a repo").is_fatal());
        assert!(BranchLinkError::store_io("lock failed").is_fatal());
        assert!(!BranchLinkError::validation("branch_name", "empty").is_fatal());
    }

    #[test]
    fn test_constructor_helpers() {
        let err = BranchLinkError::git("checkout", "pathspec did not match");
        if let BranchLinkError::Git { operation, message } = err {
            assert_eq!(operation, "checkout");
            assert_eq!(message, "pathspec did not match");
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_validation_error() {
        let err = BranchLinkError::validation("ticket_id", "must not be empty");
        if let BranchLinkError::Validation { field, reason } = err {
            assert_eq!(field, "ticket_id");
            assert_eq!(reason, "must not be empty");
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: BranchLinkError = io_err.into();
        assert!(matches!(err, BranchLinkError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
