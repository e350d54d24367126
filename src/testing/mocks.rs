//! Mock implementations of the git backend and persistence port.
//!
//! These mocks provide controllable test doubles for external
//! dependencies, enabling deterministic unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;

use crate::error::{BranchLinkError, Result};
use crate::git::{ChangeType, ChangedFile, GitBackend};
use crate::store::KeyValuePort;

/// Mock implementation of the git backend.
///
/// Tracks every checkout and stash so tests can assert on working-tree
/// side effects (or their absence).
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGitBackend::new()
///     .with_branches(["main", "feat/a"])
///     .with_dirty_files(["src/lib.rs"]);
///
/// assert!(git.checkout("feat/a", false).await.is_err());
/// ```
#[derive(Debug)]
pub struct MockGitBackend {
    state: Mutex<MockGitState>,
    fail_operations: Mutex<Option<String>>,
}

#[derive(Debug, Clone)]
struct MockGitState {
    branches: Vec<String>,
    current: Option<String>,
    dirty_files: Vec<ChangedFile>,
    checkouts: Vec<(String, bool)>,
    stashes: Vec<String>,
}

impl Default for MockGitBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockGitState {
                branches: vec!["main".to_string()],
                current: Some("main".to_string()),
                dirty_files: Vec::new(),
                checkouts: Vec::new(),
                stashes: Vec::new(),
            }),
            fail_operations: Mutex::new(None),
        }
    }
}

impl MockGitBackend {
    /// Create a new mock with a single clean `main` branch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the local branch list.
    #[must_use]
    pub fn with_branches<I, S>(self, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.state.lock().expect("mock state");
            state.branches = branches.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Set the currently checked-out branch (`None` = detached HEAD).
    #[must_use]
    pub fn with_current_branch(self, branch: impl Into<String>) -> Self {
        {
            let mut state = self.state.lock().expect("mock state");
            state.current = Some(branch.into());
        }
        self
    }

    /// Simulate a detached HEAD.
    #[must_use]
    pub fn detached(self) -> Self {
        {
            let mut state = self.state.lock().expect("mock state");
            state.current = None;
        }
        self
    }

    /// Mark the working tree dirty with modified files at these paths.
    #[must_use]
    pub fn with_dirty_files<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.state.lock().expect("mock state");
            state.dirty_files = paths
                .into_iter()
                .map(|p| ChangedFile {
                    path: p.into(),
                    change_type: ChangeType::Modified,
                })
                .collect();
        }
        self
    }

    /// Make every subsequent git call fail with this message.
    #[must_use]
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        *self.fail_operations.lock().expect("mock state") = Some(message.into());
        self
    }

    /// Remove a branch out from under the manager, as an external
    /// `git branch -D` would.
    pub fn delete_branch(&self, name: &str) {
        let mut state = self.state.lock().expect("mock state");
        state.branches.retain(|b| b != name);
    }

    /// Recorded `(branch, allow_dirty)` checkout calls.
    #[must_use]
    pub fn checkouts(&self) -> Vec<(String, bool)> {
        self.state.lock().expect("mock state").checkouts.clone()
    }

    /// Recorded stash messages.
    #[must_use]
    pub fn stashes(&self) -> Vec<String> {
        self.state.lock().expect("mock state").stashes.clone()
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        if let Some(message) = self.fail_operations.lock().expect("mock state").as_ref() {
            return Err(BranchLinkError::git(operation, message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl GitBackend for MockGitBackend {
    async fn list_local_branches(&self) -> Result<Vec<String>> {
        self.check_failure("for-each-ref")?;
        Ok(self.state.lock().expect("mock state").branches.clone())
    }

    async fn current_branch(&self) -> Result<Option<String>> {
        self.check_failure("symbolic-ref")?;
        Ok(self.state.lock().expect("mock state").current.clone())
    }

    async fn has_uncommitted_changes(&self) -> Result<bool> {
        self.check_failure("status")?;
        Ok(!self.state.lock().expect("mock state").dirty_files.is_empty())
    }

    async fn changed_files(&self) -> Result<Vec<ChangedFile>> {
        self.check_failure("status")?;
        Ok(self.state.lock().expect("mock state").dirty_files.clone())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        self.check_failure("rev-parse")?;
        Ok(self
            .state
            .lock()
            .expect("mock state")
            .branches
            .iter()
            .any(|b| b == name))
    }

    async fn checkout(&self, name: &str, allow_dirty: bool) -> Result<()> {
        self.check_failure("checkout")?;
        let mut state = self.state.lock().expect("mock state");

        if !state.branches.iter().any(|b| b == name) {
            return Err(BranchLinkError::branch_not_found(name));
        }
        if !allow_dirty && !state.dirty_files.is_empty() {
            return Err(BranchLinkError::CheckoutConflict {
                branch: name.to_string(),
                dirty_files: state.dirty_files.len(),
            });
        }

        state.current = Some(name.to_string());
        state.checkouts.push((name.to_string(), allow_dirty));
        Ok(())
    }

    async fn checkout_new(&self, name: &str) -> Result<()> {
        self.check_failure("checkout")?;
        let mut state = self.state.lock().expect("mock state");

        if state.branches.iter().any(|b| b == name) {
            return Err(BranchLinkError::git(
                "checkout",
                format!("a branch named '{name}' already exists"),
            ));
        }

        state.branches.push(name.to_string());
        state.current = Some(name.to_string());
        state.checkouts.push((name.to_string(), false));
        Ok(())
    }

    async fn stash(&self, message: &str) -> Result<()> {
        self.check_failure("stash")?;
        let mut state = self.state.lock().expect("mock state");
        state.dirty_files.clear();
        state.stashes.push(message.to_string());
        Ok(())
    }
}

/// In-memory key-value port with failure injection.
///
/// # Example
///
/// ```rust,ignore
/// let port = MemoryKeyValuePort::new();
/// port.fail_next(1); // next operation errors, then recovers
/// ```
#[derive(Debug, Default)]
pub struct MemoryKeyValuePort {
    values: Mutex<HashMap<String, String>>,
    failures_remaining: AtomicU32,
}

impl MemoryKeyValuePort {
    /// Create an empty port.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without going through the async interface.
    pub fn preload(&self, key: &str, value: &str) {
        self.values
            .lock()
            .expect("mock state")
            .insert(key.to_string(), value.to_string());
    }

    /// Make the next `count` operations fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> anyhow::Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            bail!("injected store failure ({remaining} remaining)");
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValuePort for MemoryKeyValuePort {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.maybe_fail()?;
        Ok(self.values.lock().expect("mock state").get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.maybe_fail()?;
        self.values
            .lock()
            .expect("mock state")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.maybe_fail()?;
        self.values.lock().expect("mock state").remove(key);
        Ok(())
    }
}
