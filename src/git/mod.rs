//! Git bridge: branch enumeration, working-tree inspection, checkout
//! and stash over a local `git` executable.
//!
//! The bridge shells out to git with `tokio::process` and serializes its
//! own subprocess calls per workspace, so concurrent operations never
//! contend on git's internal index lock. Anything beyond branch
//! listing/checkout/stash (merges, object surgery) is out of scope.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BranchLinkError, Result};

/// Kind of change a working-tree file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Modified,
    Added,
    Deleted,
    Renamed,
    Untracked,
}

/// A single uncommitted working-tree change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub change_type: ChangeType,
}

/// Display-capped view of the uncommitted changes in a working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSummary {
    /// First `shown` files, in git status order.
    pub files: Vec<ChangedFile>,
    /// Total number of changed files, including omitted ones.
    pub total: usize,
    /// How many files were cut off by the display cap.
    pub omitted: usize,
}

impl ChangesSummary {
    /// Cap a full change list for display: the first `shown` entries plus
    /// a remaining count.
    #[must_use]
    pub fn from_files(files: Vec<ChangedFile>, shown: usize) -> Self {
        let total = files.len();
        let omitted = total.saturating_sub(shown);
        let mut files = files;
        files.truncate(shown);
        Self {
            files,
            total,
            omitted,
        }
    }

    /// Whether the working tree had any changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Abstraction over the git operations the association manager needs.
///
/// The production implementation is [`GitBridge`]; tests substitute
/// `MockGitBackend` from the testing module.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Ordered list of local branch names (remotes excluded).
    ///
    /// # Errors
    ///
    /// Returns a git error if the workspace is not a repository.
    async fn list_local_branches(&self) -> Result<Vec<String>>;

    /// The currently checked-out branch, or `None` on a detached HEAD.
    async fn current_branch(&self) -> Result<Option<String>>;

    /// Whether the working tree has uncommitted changes (staged,
    /// unstaged, or untracked).
    async fn has_uncommitted_changes(&self) -> Result<bool>;

    /// Full list of uncommitted working-tree changes.
    async fn changed_files(&self) -> Result<Vec<ChangedFile>>;

    /// Whether a local branch with this name exists.
    async fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Check out an existing local branch.
    ///
    /// # Errors
    ///
    /// Returns `BranchNotFound` if the branch is absent and
    /// `CheckoutConflict` if uncommitted changes exist and `allow_dirty`
    /// was not requested.
    async fn checkout(&self, name: &str, allow_dirty: bool) -> Result<()>;

    /// Create a new branch at HEAD and check it out.
    async fn checkout_new(&self, name: &str) -> Result<()>;

    /// Stash all working-tree changes (untracked included) under the
    /// given message.
    async fn stash(&self, message: &str) -> Result<()>;

    /// Display-capped summary of the uncommitted changes.
    async fn changed_files_summary(&self, shown: usize) -> Result<ChangesSummary> {
        Ok(ChangesSummary::from_files(
            self.changed_files().await?,
            shown,
        ))
    }
}

/// Thin wrapper over a local `git` executable, scoped to one workspace.
#[derive(Debug)]
pub struct GitBridge {
    workspace: PathBuf,
    /// Serializes subprocess calls for this workspace.
    subprocess_lock: Mutex<()>,
}

impl GitBridge {
    /// Create a bridge for the given workspace directory.
    ///
    /// # Errors
    ///
    /// Returns a git error if no `git` executable is on the PATH.
    pub fn new(workspace: impl AsRef<Path>) -> Result<Self> {
        which::which("git")
            .map_err(|e| BranchLinkError::git("locate", format!("git executable not found: {e}")))?;

        Ok(Self {
            workspace: workspace.as_ref().to_path_buf(),
            subprocess_lock: Mutex::new(()),
        })
    }

    /// The workspace directory this bridge operates on.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Run git with the given args, returning the raw output regardless
    /// of exit status. Spawn failures become git errors.
    async fn run(&self, operation: &str, args: &[&str]) -> Result<Output> {
        let _guard = self.subprocess_lock.lock().await;
        debug!(operation, ?args, "running git");

        Command::new("git")
            .args(args)
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| BranchLinkError::git(operation, e.to_string()))
    }

    /// Run git and require a zero exit status, returning stdout.
    async fn run_checked(&self, operation: &str, args: &[&str]) -> Result<String> {
        let output = self.run(operation, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(operation, %stderr, "git command failed");
            return Err(BranchLinkError::git(operation, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl GitBackend for GitBridge {
    async fn list_local_branches(&self) -> Result<Vec<String>> {
        let stdout = self
            .run_checked(
                "for-each-ref",
                &["for-each-ref", "refs/heads", "--format=%(refname:short)"],
            )
            .await?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn current_branch(&self) -> Result<Option<String>> {
        // -q makes a detached HEAD exit 1 with no output instead of erroring.
        let output = self
            .run("symbolic-ref", &["symbolic-ref", "--short", "-q", "HEAD"])
            .await?;

        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok(Some(name));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Ok(None)
        } else {
            Err(BranchLinkError::git("symbolic-ref", stderr))
        }
    }

    async fn has_uncommitted_changes(&self) -> Result<bool> {
        let stdout = self
            .run_checked("status", &["status", "--porcelain"])
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn changed_files(&self) -> Result<Vec<ChangedFile>> {
        let stdout = self
            .run_checked("status", &["status", "--porcelain"])
            .await?;
        Ok(parse_porcelain_status(&stdout))
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let output = self
            .run(
                "rev-parse",
                &["rev-parse", "--verify", "--quiet", &refname],
            )
            .await?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Ok(false)
        } else {
            Err(BranchLinkError::git("rev-parse", stderr))
        }
    }

    async fn checkout(&self, name: &str, allow_dirty: bool) -> Result<()> {
        if !self.branch_exists(name).await? {
            return Err(BranchLinkError::branch_not_found(name));
        }

        if !allow_dirty {
            let dirty = self.changed_files().await?;
            if !dirty.is_empty() {
                return Err(BranchLinkError::CheckoutConflict {
                    branch: name.to_string(),
                    dirty_files: dirty.len(),
                });
            }
        }

        self.run_checked("checkout", &["checkout", name]).await?;
        debug!(branch = name, "checked out");
        Ok(())
    }

    async fn checkout_new(&self, name: &str) -> Result<()> {
        self.run_checked("checkout", &["checkout", "-b", name])
            .await?;
        debug!(branch = name, "created and checked out");
        Ok(())
    }

    async fn stash(&self, message: &str) -> Result<()> {
        self.run_checked("stash", &["stash", "push", "-u", "-m", message])
            .await?;
        debug!(message, "stashed working tree");
        Ok(())
    }
}

/// Parse `git status --porcelain` output into changed files.
///
/// Lines look like `XY path`, with `?? path` for untracked files and
/// `R  old -> new` for renames.
fn parse_porcelain_status(output: &str) -> Vec<ChangedFile> {
    let mut files = Vec::new();

    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let (status, rest) = line.split_at(2);
        let path = rest.trim_start();
        if path.is_empty() {
            continue;
        }

        let change_type = if status == "??" {
            ChangeType::Untracked
        } else if status.contains('R') {
            ChangeType::Renamed
        } else if status.contains('D') {
            ChangeType::Deleted
        } else if status.contains('A') {
            ChangeType::Added
        } else {
            ChangeType::Modified
        };

        // Renames report "old -> new"; the new path is the one that matters.
        let path = match change_type {
            ChangeType::Renamed => path.rsplit(" -> ").next().unwrap_or(path),
            _ => path,
        };

        files.push(ChangedFile {
            path: path.to_string(),
            change_type,
        });
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_modified_and_untracked() {
        let output = " M src/lib.rs\n?? notes.txt\n";
        let files = parse_porcelain_status(output);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[0].change_type, ChangeType::Modified);
        assert_eq!(files[1].path, "notes.txt");
        assert_eq!(files[1].change_type, ChangeType::Untracked);
    }

    #[test]
    fn test_parse_porcelain_added_and_deleted() {
        let output = "A  new.rs\n D gone.rs\n";
        let files = parse_porcelain_status(output);
        assert_eq!(files[0].change_type, ChangeType::Added);
        assert_eq!(files[1].change_type, ChangeType::Deleted);
    }

    #[test]
    fn test_parse_porcelain_rename_uses_new_path() {
        let output = "R  old_name.rs -> new_name.rs\n";
        let files = parse_porcelain_status(output);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "new_name.rs");
        assert_eq!(files[0].change_type, ChangeType::Renamed);
    }

    #[test]
    fn test_parse_porcelain_empty_output() {
        assert!(parse_porcelain_status("").is_empty());
        assert!(parse_porcelain_status("\n\n").is_empty());
    }

    #[test]
    fn test_changes_summary_caps_display() {
        let files: Vec<ChangedFile> = (0..8)
            .map(|i| ChangedFile {
                path: format!("file{i}.rs"),
                change_type: ChangeType::Modified,
            })
            .collect();

        let summary = ChangesSummary::from_files(files, 5);
        assert_eq!(summary.files.len(), 5);
        assert_eq!(summary.total, 8);
        assert_eq!(summary.omitted, 3);
        assert_eq!(summary.files[0].path, "file0.rs");
        assert!(!summary.is_empty());
    }

    #[test]
    fn test_changes_summary_under_cap() {
        let files = vec![ChangedFile {
            path: "only.rs".to_string(),
            change_type: ChangeType::Added,
        }];

        let summary = ChangesSummary::from_files(files, 5);
        assert_eq!(summary.files.len(), 1);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.omitted, 0);
    }

    #[test]
    fn test_changes_summary_empty() {
        let summary = ChangesSummary::from_files(Vec::new(), 5);
        assert!(summary.is_empty());
        assert_eq!(summary.omitted, 0);
    }
}
