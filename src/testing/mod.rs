//! Testing infrastructure for branchlink.
//!
//! This module provides mocks for the external seams — the git backend
//! and the persistence port — so manager and store logic can be tested
//! without real repositories or disk state.
//!
//! # Example
//!
//! ```rust,ignore
//! use branchlink::testing::{MemoryKeyValuePort, MockGitBackend};
//!
//! let git = MockGitBackend::new()
//!     .with_branches(["main", "fix/ENG-5-bug"])
//!     .with_current_branch("main");
//!
//! let port = MemoryKeyValuePort::new();
//! ```

pub mod mocks;

// Re-export commonly used types
pub use mocks::*;
