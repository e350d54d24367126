//! branchlink - Branch-Ticket Association Manager
//!
//! Links version-control branches to external tracking-ticket
//! identifiers, protects users from losing uncommitted work during
//! branch switches, auto-discovers candidate links from naming
//! conventions, and produces maintenance diagnostics (stale, duplicate,
//! and aging links).
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`git`] - Subprocess git bridge and backend abstraction
//! - [`manager`] - Lifecycle orchestrator and safe-checkout protocol
//! - [`pattern`] - Ticket-id extraction from branch names
//! - [`store`] - Persistent associations over a key-value port
//! - [`testing`] - Testing infrastructure (mocks for git and storage)
//!
//! # Example
//!
//! ```rust,ignore
//! use branchlink::manager::{AssociationManager, CheckoutDecision, CheckoutOutcome};
//!
//! let manager = AssociationManager::for_workspace(".")?;
//!
//! manager.associate_branch("ENG-123", "feature/ENG-123-login").await?;
//!
//! match manager.checkout_for_ticket("ENG-123", None).await? {
//!     CheckoutOutcome::CheckedOut { branch_name, .. } => {
//!         println!("on {branch_name}");
//!     }
//!     CheckoutOutcome::DecisionRequired(request) => {
//!         // Render request.changes, ask the user, then re-invoke with
//!         // Some(CheckoutDecision::StashAndCheckout) or another option.
//!     }
//!     CheckoutOutcome::Cancelled { .. } => {}
//! }
//! ```

pub mod config;
pub mod error;
pub mod git;
pub mod manager;
pub mod pattern;
pub mod store;
pub mod testing;

// Re-export commonly used types
pub use error::{BranchLinkError, Result};

// Re-export config types
pub use config::{ManagerConfig, PatternConfig, ThresholdConfig, CONFIG_FILE};

// Re-export git types
pub use git::{ChangeType, ChangedFile, ChangesSummary, GitBackend, GitBridge};

// Re-export pattern types
pub use pattern::{TicketPattern, DEFAULT_GRAMMAR};

// Re-export store types
pub use store::{
    AssociationStore, BranchAssociation, FileKeyValuePort, HistoryEntry, KeyValuePort,
    TicketSnapshot,
};

// Re-export manager types
pub use manager::{
    AgingAssociation, AnalyticsSnapshot, AssociationManager, AutoDetectCandidate, BranchUsage,
    CheckoutDecision, CheckoutDecisionRequest, CheckoutOutcome, CleanupReport, CleanupSuggestion,
    ConfirmOutcome, SkippedCandidate, SkippedCleanup, SuggestionKind, TicketState,
};

// Re-export testing doubles for consumers writing their own tests
pub use testing::{MemoryKeyValuePort, MockGitBackend};
