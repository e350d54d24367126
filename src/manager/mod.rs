//! Association manager: the orchestrator tying the git bridge, the
//! pattern matcher, and the association store into the ticket-branch
//! lifecycle.
//!
//! Per ticket, the manager walks a small state machine — `Unassociated`,
//! `Associated`, `Stale` (branch deleted externally, detected lazily on
//! query) — and guards the one operation with working-tree side effects:
//! a checkout over uncommitted changes never proceeds without an
//! explicit caller decision.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{BranchLinkError, Result};
use crate::git::{ChangesSummary, GitBackend, GitBridge};
use crate::pattern::TicketPattern;
use crate::store::{
    AssociationStore, BranchAssociation, FileKeyValuePort, HistoryEntry, KeyValuePort,
};

/// Directory under the workspace root used by [`AssociationManager::for_workspace`].
pub const STORAGE_DIR: &str = ".branchlink";

/// How many entries the most-used analytics list carries.
const MOST_USED_LIMIT: usize = 5;

/// Lifecycle state of a ticket, for the UI to switch on directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TicketState {
    /// No active association.
    Unassociated,
    /// Active association whose branch exists locally.
    Associated(BranchAssociation),
    /// Active association whose branch no longer exists locally.
    Stale(BranchAssociation),
}

/// Caller's resolution of a checkout over uncommitted changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutDecision {
    /// Stash everything (untracked included), then check out.
    StashAndCheckout,
    /// Check out with the dirty working tree carried along.
    CheckoutAnyway,
    /// Leave the working tree untouched.
    Cancel,
}

/// Structured request for a decision the manager will not make itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutDecisionRequest {
    pub ticket_id: String,
    pub branch_name: String,
    /// Display-capped summary of what would be at risk.
    pub changes: ChangesSummary,
    /// The exact options the caller may answer with.
    pub options: Vec<CheckoutDecision>,
}

/// Result of a checkout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutOutcome {
    /// The branch was checked out; `stash_message` is set when changes
    /// were stashed first.
    CheckedOut {
        ticket_id: String,
        branch_name: String,
        stash_message: Option<String>,
    },
    /// Uncommitted changes exist and no decision was supplied.
    DecisionRequired(CheckoutDecisionRequest),
    /// The caller chose to cancel; nothing was touched.
    Cancelled {
        ticket_id: String,
        branch_name: String,
    },
}

/// Candidate ticket/branch pair discovered from naming conventions.
///
/// Proposals only: nothing is committed until the caller confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDetectCandidate {
    pub ticket_id: String,
    pub branch_name: String,
}

/// Result of confirming a batch of auto-detected candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub confirmed: Vec<AutoDetectCandidate>,
    pub skipped: Vec<SkippedCandidate>,
}

/// A candidate that was not committed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub ticket_id: String,
    pub branch_name: String,
    pub reason: String,
}

/// Aggregated association analytics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    /// Tickets with any recorded history.
    pub total_tracked: usize,
    /// Tickets with an active association.
    pub active: usize,
    /// Active associations whose branch no longer exists.
    pub stale: usize,
    /// Active associations unused beyond the configured threshold,
    /// oldest first.
    pub aging: Vec<AgingAssociation>,
    /// Most-frequently-used branches; ties broken by most recent use.
    pub most_used: Vec<BranchUsage>,
}

/// An active association that has not been used recently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingAssociation {
    pub ticket_id: String,
    pub branch_name: String,
    pub idle_days: i64,
}

/// Usage record for one branch in the frequency analytics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchUsage {
    pub ticket_id: String,
    pub branch_name: String,
    pub use_count: u64,
    pub last_used: DateTime<Utc>,
}

/// Kind of maintenance a cleanup suggestion proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Branch no longer exists; pure soft-delete, safely auto-actionable.
    Stale,
    /// Unused beyond the age threshold; needs per-item confirmation.
    Old,
    /// Same branch referenced by more than one ticket; advisory only.
    Duplicate,
}

/// Maintenance diagnostic derived from the store and git, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSuggestion {
    /// Deterministic id, stable across queries while the condition holds.
    pub id: String,
    pub kind: SuggestionKind,
    pub ticket_id: String,
    pub branch_name: String,
    /// Other tickets sharing the branch (duplicates only).
    pub related_tickets: Vec<String>,
    pub reason: String,
}

impl CleanupSuggestion {
    /// Whether applying this suggestion without further confirmation is
    /// safe. Only stale links qualify: the branch is already gone, so
    /// removal is a pure soft-delete.
    #[must_use]
    pub fn auto_actionable(&self) -> bool {
        matches!(self.kind, SuggestionKind::Stale)
    }
}

/// Result of applying a batch of cleanup suggestions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Suggestion ids that were applied.
    pub applied: Vec<String>,
    /// Suggestion ids that were not, and why.
    pub skipped: Vec<SkippedCleanup>,
}

/// A cleanup id that was not applied, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCleanup {
    pub id: String,
    pub reason: String,
}

/// Orchestrator for the branch-ticket association lifecycle.
pub struct AssociationManager {
    git: Arc<dyn GitBackend>,
    store: AssociationStore,
    pattern: TicketPattern,
    config: ManagerConfig,
    /// Per-ticket serialization of mutating operations.
    ticket_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AssociationManager {
    /// Create a manager over explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the configured grammar does not
    /// compile.
    pub fn new(
        git: Arc<dyn GitBackend>,
        port: Arc<dyn KeyValuePort>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let pattern = config.compile_pattern()?;
        Ok(Self {
            git,
            store: AssociationStore::new(port),
            pattern,
            config,
            ticket_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Create a manager for a workspace directory: subprocess git
    /// bridge, file-backed store under `.branchlink/`, and
    /// `branchlink.toml` configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if git is unavailable or the configuration is
    /// invalid.
    pub fn for_workspace(workspace_dir: impl AsRef<Path>) -> Result<Self> {
        let workspace_dir = workspace_dir.as_ref();
        let config = ManagerConfig::load(workspace_dir)?;
        let git = Arc::new(GitBridge::new(workspace_dir)?);
        let port = Arc::new(FileKeyValuePort::new(workspace_dir.join(STORAGE_DIR)));
        Self::new(git, port, config)
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Link a ticket to a branch.
    ///
    /// Upserts even if the branch does not yet exist locally, since an
    /// association may precede branch creation. A prior association for
    /// the ticket is superseded into history.
    pub async fn associate_branch(&self, ticket_id: &str, branch_name: &str) -> Result<()> {
        let ticket_id = validate_ticket_id(ticket_id)?;
        let branch_name = validate_branch_name(branch_name)?;

        let lock = self.lock_for(&ticket_id);
        let _guard = lock.lock().await;

        self.store.set(&ticket_id, &branch_name, false).await?;
        info!(%ticket_id, %branch_name, "associated");
        Ok(())
    }

    /// Start work on a ticket: create (or reuse) the branch, check it
    /// out, then associate it.
    ///
    /// The store is only written after the git side succeeded, so an
    /// interrupted flow leaves no partial state.
    pub async fn start_work(&self, ticket_id: &str, branch_name: &str) -> Result<()> {
        let ticket_id = validate_ticket_id(ticket_id)?;
        let branch_name = validate_branch_name(branch_name)?;

        let lock = self.lock_for(&ticket_id);
        let _guard = lock.lock().await;

        if self.git.branch_exists(&branch_name).await? {
            self.git.checkout(&branch_name, false).await?;
        } else {
            self.git.checkout_new(&branch_name).await?;
        }

        self.store.set(&ticket_id, &branch_name, false).await?;
        self.store.touch(&ticket_id).await?;
        info!(%ticket_id, %branch_name, "started work");
        Ok(())
    }

    /// Drop the active association for a ticket. History is retained;
    /// disassociating an unassociated ticket is a no-op.
    pub async fn disassociate(&self, ticket_id: &str) -> Result<()> {
        let ticket_id = validate_ticket_id(ticket_id)?;

        let lock = self.lock_for(&ticket_id);
        let _guard = lock.lock().await;

        self.store.remove(&ticket_id).await?;
        info!(%ticket_id, "disassociated");
        Ok(())
    }

    /// Current lifecycle state of a ticket. Staleness is checked here,
    /// lazily, against the live branch list.
    pub async fn ticket_state(&self, ticket_id: &str) -> Result<TicketState> {
        let ticket_id = validate_ticket_id(ticket_id)?;

        let Some(association) = self.store.get(&ticket_id).await? else {
            return Ok(TicketState::Unassociated);
        };

        if self.git.branch_exists(&association.branch_name).await? {
            Ok(TicketState::Associated(association))
        } else {
            Ok(TicketState::Stale(association))
        }
    }

    /// Full association timeline for a ticket, most-recent-first.
    pub async fn history(&self, ticket_id: &str) -> Result<Vec<HistoryEntry>> {
        let ticket_id = validate_ticket_id(ticket_id)?;
        self.store.history_for(&ticket_id).await
    }

    /// Current active mapping of ticket id to association.
    pub async fn all_associations(&self) -> Result<BTreeMap<String, BranchAssociation>> {
        self.store.all_associations().await
    }

    // =========================================================================
    // Safe checkout
    // =========================================================================

    /// Check out the branch associated with a ticket.
    ///
    /// With uncommitted changes present and no `decision` supplied,
    /// returns [`CheckoutOutcome::DecisionRequired`] instead of choosing
    /// automatically; the caller re-invokes with the user's answer. On a
    /// successful checkout the active entry's usage is touched.
    ///
    /// # Errors
    ///
    /// `NotAssociated` if the ticket has no active association,
    /// `StaleAssociation` if the branch no longer exists, plus any git
    /// or store failure.
    pub async fn checkout_for_ticket(
        &self,
        ticket_id: &str,
        decision: Option<CheckoutDecision>,
    ) -> Result<CheckoutOutcome> {
        let ticket_id = validate_ticket_id(ticket_id)?;

        let lock = self.lock_for(&ticket_id);
        let _guard = lock.lock().await;

        let association = self
            .store
            .get(&ticket_id)
            .await?
            .ok_or_else(|| BranchLinkError::not_associated(&ticket_id))?;
        let branch_name = association.branch_name;

        if !self.git.branch_exists(&branch_name).await? {
            return Err(BranchLinkError::stale_association(&ticket_id, &branch_name));
        }

        let mut stash_message = None;

        if self.git.has_uncommitted_changes().await? {
            let Some(decision) = decision else {
                let changes = self
                    .git
                    .changed_files_summary(self.config.thresholds.changed_files_shown)
                    .await?;
                debug!(%ticket_id, %branch_name, "decision required for dirty tree");
                return Ok(CheckoutOutcome::DecisionRequired(CheckoutDecisionRequest {
                    ticket_id,
                    branch_name,
                    changes,
                    options: vec![
                        CheckoutDecision::StashAndCheckout,
                        CheckoutDecision::CheckoutAnyway,
                        CheckoutDecision::Cancel,
                    ],
                }));
            };

            match decision {
                CheckoutDecision::Cancel => {
                    debug!(%ticket_id, %branch_name, "checkout cancelled");
                    return Ok(CheckoutOutcome::Cancelled {
                        ticket_id,
                        branch_name,
                    });
                }
                CheckoutDecision::StashAndCheckout => {
                    let message = format!(
                        "branchlink: {ticket_id} before checkout at {}",
                        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
                    );
                    self.git.stash(&message).await?;
                    self.git.checkout(&branch_name, false).await?;
                    stash_message = Some(message);
                }
                CheckoutDecision::CheckoutAnyway => {
                    self.git.checkout(&branch_name, true).await?;
                }
            }
        } else {
            self.git.checkout(&branch_name, false).await?;
        }

        self.store.touch(&ticket_id).await?;
        info!(%ticket_id, %branch_name, "checked out");
        Ok(CheckoutOutcome::CheckedOut {
            ticket_id,
            branch_name,
            stash_message,
        })
    }

    // =========================================================================
    // Auto-detection
    // =========================================================================

    /// Discover candidate ticket/branch pairs from branch naming
    /// conventions.
    ///
    /// Branches already serving as someone's active association are
    /// skipped, as are tickets that already have one. Nothing is
    /// committed; pass the returned candidates to
    /// [`confirm_candidates`](Self::confirm_candidates).
    pub async fn auto_detect_associations(&self) -> Result<Vec<AutoDetectCandidate>> {
        let branches = self.git.list_local_branches().await?;
        let associations = self.store.all_associations().await?;

        let associated_branches: HashSet<&str> = associations
            .values()
            .map(|a| a.branch_name.as_str())
            .collect();

        let mut candidates = Vec::new();
        for branch in &branches {
            if associated_branches.contains(branch.as_str()) {
                continue;
            }
            let Some(ticket_id) = self.pattern.extract(branch) else {
                continue;
            };
            if associations.contains_key(&ticket_id) {
                debug!(%ticket_id, %branch, "skipping candidate: ticket already associated");
                continue;
            }
            candidates.push(AutoDetectCandidate {
                ticket_id,
                branch_name: branch.clone(),
            });
        }

        candidates.sort_by(|a, b| {
            (a.ticket_id.as_str(), a.branch_name.as_str())
                .cmp(&(b.ticket_id.as_str(), b.branch_name.as_str()))
        });
        debug!(count = candidates.len(), "auto-detection complete");
        Ok(candidates)
    }

    /// Commit a batch of previously returned candidates as
    /// auto-detected associations.
    ///
    /// Per-item failures (including a ticket that gained an association
    /// since detection) are skipped and reported; the batch never
    /// aborts as a whole.
    pub async fn confirm_candidates(
        &self,
        candidates: &[AutoDetectCandidate],
    ) -> Result<ConfirmOutcome> {
        let mut outcome = ConfirmOutcome::default();

        for candidate in candidates {
            match self.confirm_one(candidate).await {
                Ok(()) => outcome.confirmed.push(candidate.clone()),
                Err(e) => {
                    warn!(
                        ticket_id = %candidate.ticket_id,
                        branch_name = %candidate.branch_name,
                        "candidate skipped: {e}"
                    );
                    outcome.skipped.push(SkippedCandidate {
                        ticket_id: candidate.ticket_id.clone(),
                        branch_name: candidate.branch_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }

    async fn confirm_one(&self, candidate: &AutoDetectCandidate) -> Result<()> {
        let ticket_id = validate_ticket_id(&candidate.ticket_id)?;
        let branch_name = validate_branch_name(&candidate.branch_name)?;

        let lock = self.lock_for(&ticket_id);
        let _guard = lock.lock().await;

        if self.store.get(&ticket_id).await?.is_some() {
            return Err(BranchLinkError::validation(
                "candidate",
                format!("ticket {ticket_id} gained an association since detection"),
            ));
        }

        self.store.set(&ticket_id, &branch_name, true).await?;
        info!(%ticket_id, %branch_name, "auto-detected association confirmed");
        Ok(())
    }

    // =========================================================================
    // Analytics & cleanup
    // =========================================================================

    /// Aggregate association analytics.
    pub async fn analytics(&self) -> Result<AnalyticsSnapshot> {
        let snapshot = self.store.snapshot().await?;
        let existing: HashSet<String> =
            self.git.list_local_branches().await?.into_iter().collect();
        let now = Utc::now();
        let threshold_days = i64::from(self.config.thresholds.old_after_days);

        let mut active = 0;
        let mut stale = 0;
        let mut aging = Vec::new();
        let mut most_used = Vec::new();

        for ticket in &snapshot {
            if let Some(association) = &ticket.association {
                active += 1;
                if !existing.contains(&association.branch_name) {
                    stale += 1;
                }

                if let Some(entry) = ticket.history.iter().find(|e| e.is_active) {
                    let idle_days = (now - entry.last_used).num_days();
                    if idle_days >= threshold_days {
                        aging.push(AgingAssociation {
                            ticket_id: ticket.ticket_id.clone(),
                            branch_name: association.branch_name.clone(),
                            idle_days,
                        });
                    }
                }
            }

            for entry in &ticket.history {
                if entry.use_count > 0 {
                    most_used.push(BranchUsage {
                        ticket_id: ticket.ticket_id.clone(),
                        branch_name: entry.branch_name.clone(),
                        use_count: entry.use_count,
                        last_used: entry.last_used,
                    });
                }
            }
        }

        aging.sort_by(|a, b| b.idle_days.cmp(&a.idle_days));
        most_used.sort_by(|a, b| {
            b.use_count
                .cmp(&a.use_count)
                .then(b.last_used.cmp(&a.last_used))
        });
        most_used.truncate(MOST_USED_LIMIT);

        Ok(AnalyticsSnapshot {
            total_tracked: snapshot.len(),
            active,
            stale,
            aging,
            most_used,
        })
    }

    /// Maintenance diagnostics for the current associations.
    ///
    /// Stale links (branch gone) are safely auto-actionable; old links
    /// need per-item confirmation; duplicates are advisory only.
    pub async fn cleanup_suggestions(&self) -> Result<Vec<CleanupSuggestion>> {
        let snapshot = self.store.snapshot().await?;
        let existing: HashSet<String> =
            self.git.list_local_branches().await?.into_iter().collect();
        let now = Utc::now();
        let threshold_days = i64::from(self.config.thresholds.old_after_days);

        let mut suggestions = Vec::new();
        let mut branch_tickets: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for ticket in &snapshot {
            let Some(association) = &ticket.association else {
                continue;
            };
            let branch = association.branch_name.as_str();
            branch_tickets
                .entry(branch)
                .or_default()
                .push(ticket.ticket_id.as_str());

            if !existing.contains(branch) {
                suggestions.push(CleanupSuggestion {
                    id: format!("stale:{}:{branch}", ticket.ticket_id),
                    kind: SuggestionKind::Stale,
                    ticket_id: ticket.ticket_id.clone(),
                    branch_name: branch.to_string(),
                    related_tickets: Vec::new(),
                    reason: format!("branch '{branch}' no longer exists locally"),
                });
                continue;
            }

            if let Some(entry) = ticket.history.iter().find(|e| e.is_active) {
                let idle_days = (now - entry.last_used).num_days();
                if idle_days >= threshold_days {
                    suggestions.push(CleanupSuggestion {
                        id: format!("old:{}:{branch}", ticket.ticket_id),
                        kind: SuggestionKind::Old,
                        ticket_id: ticket.ticket_id.clone(),
                        branch_name: branch.to_string(),
                        related_tickets: Vec::new(),
                        reason: format!("unused for {idle_days} days"),
                    });
                }
            }
        }

        for (branch, tickets) in branch_tickets {
            if tickets.len() < 2 {
                continue;
            }
            let mut tickets: Vec<String> = tickets.iter().map(ToString::to_string).collect();
            tickets.sort();
            suggestions.push(CleanupSuggestion {
                id: format!("duplicate:{branch}"),
                kind: SuggestionKind::Duplicate,
                ticket_id: tickets[0].clone(),
                branch_name: branch.to_string(),
                related_tickets: tickets[1..].to_vec(),
                reason: format!(
                    "branch '{branch}' is referenced by {} tickets: {}",
                    tickets.len(),
                    tickets.join(", ")
                ),
            });
        }

        debug!(count = suggestions.len(), "cleanup suggestions computed");
        Ok(suggestions)
    }

    /// Apply a batch of cleanup suggestions by id.
    ///
    /// Passing an `old` id counts as its per-item confirmation.
    /// Duplicate suggestions are advisory and always skipped; ids whose
    /// condition no longer holds are skipped too. Per-item failures
    /// never abort the batch.
    pub async fn apply_cleanup(&self, suggestion_ids: &[String]) -> Result<CleanupReport> {
        let current = self.cleanup_suggestions().await?;
        let by_id: HashMap<&str, &CleanupSuggestion> =
            current.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut report = CleanupReport::default();

        for id in suggestion_ids {
            let Some(suggestion) = by_id.get(id.as_str()) else {
                report.skipped.push(SkippedCleanup {
                    id: id.clone(),
                    reason: "suggestion no longer applies".to_string(),
                });
                continue;
            };

            if suggestion.kind == SuggestionKind::Duplicate {
                report.skipped.push(SkippedCleanup {
                    id: id.clone(),
                    reason: "duplicate links are advisory and never auto-resolved".to_string(),
                });
                continue;
            }

            let ticket_id = suggestion.ticket_id.clone();
            let lock = self.lock_for(&ticket_id);
            let _guard = lock.lock().await;

            match self.store.remove(&ticket_id).await {
                Ok(()) => {
                    info!(%ticket_id, %id, "cleanup applied");
                    report.applied.push(id.clone());
                }
                Err(e) => {
                    warn!(%ticket_id, %id, "cleanup failed: {e}");
                    report.skipped.push(SkippedCleanup {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Fetch or create the mutation lock for a ticket.
    fn lock_for(&self, ticket_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.ticket_locks.lock().expect("ticket lock map");
        locks
            .entry(ticket_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn validate_ticket_id(ticket_id: &str) -> Result<String> {
    let trimmed = ticket_id.trim();
    if trimmed.is_empty() {
        return Err(BranchLinkError::validation(
            "ticket_id",
            "must not be empty",
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_branch_name(branch_name: &str) -> Result<String> {
    let trimmed = branch_name.trim();
    if trimmed.is_empty() {
        return Err(BranchLinkError::validation(
            "branch_name",
            "must not be empty",
        ));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(BranchLinkError::validation(
            "branch_name",
            "must not contain whitespace",
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::STORE_KEY;
    use crate::testing::{MemoryKeyValuePort, MockGitBackend};

    fn manager_with(
        git: MockGitBackend,
    ) -> (
        AssociationManager,
        Arc<MockGitBackend>,
        Arc<MemoryKeyValuePort>,
    ) {
        let git = Arc::new(git);
        let port = Arc::new(MemoryKeyValuePort::new());
        let manager = AssociationManager::new(git.clone(), port.clone(), ManagerConfig::default())
            .expect("manager");
        (manager, git, port)
    }

    /// Rewrite every stored timestamp for a ticket to `days` ago, so age
    /// thresholds can be tested without waiting.
    async fn age_ticket(port: &MemoryKeyValuePort, ticket_id: &str, days: i64) {
        let raw = port
            .get(STORE_KEY)
            .await
            .expect("get")
            .expect("document present");
        let mut doc: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        let stamp = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();

        let record = &mut doc["tickets"][ticket_id];
        if !record["association"].is_null() {
            record["association"]["last_updated"] = stamp.clone().into();
        }
        for entry in record["history"].as_array_mut().expect("history array") {
            entry["associated_at"] = stamp.clone().into();
            entry["last_used"] = stamp.clone().into();
        }

        port.preload(STORE_KEY, &doc.to_string());
    }

    // =========================================================================
    // Association lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_associate_then_state_is_associated() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");

        match manager.ticket_state("ENG-1").await.expect("state") {
            TicketState::Associated(a) => assert_eq!(a.branch_name, "feat/a"),
            other => panic!("expected Associated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_associate_rejects_empty_inputs() {
        let (manager, _git, _port) = manager_with(MockGitBackend::new());

        let err = manager.associate_branch("ENG-1", "  ").await.unwrap_err();
        assert!(matches!(err, BranchLinkError::Validation { .. }));

        let err = manager.associate_branch("", "feat/a").await.unwrap_err();
        assert!(matches!(err, BranchLinkError::Validation { .. }));

        let err = manager
            .associate_branch("ENG-1", "feat a")
            .await
            .unwrap_err();
        assert!(matches!(err, BranchLinkError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_associate_allows_nonexistent_branch() {
        // Association may precede branch creation.
        let (manager, _git, _port) = manager_with(MockGitBackend::new());

        manager
            .associate_branch("ENG-1", "feat/not-yet")
            .await
            .expect("associate");

        match manager.ticket_state("ENG-1").await.expect("state") {
            TicketState::Stale(a) => assert_eq!(a.branch_name, "feat/not-yet"),
            other => panic!("expected Stale, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reassociate_supersedes() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a", "feat/b"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        manager.associate_branch("ENG-1", "feat/b").await.expect("associate");

        let history = manager.history("ENG-1").await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|e| e.is_active).count(), 1);
        assert_eq!(history[0].branch_name, "feat/b");
    }

    #[tokio::test]
    async fn test_disassociate_then_reassociate_restores_state() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        manager.disassociate("ENG-1").await.expect("disassociate");
        assert_eq!(
            manager.ticket_state("ENG-1").await.expect("state"),
            TicketState::Unassociated
        );

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        match manager.ticket_state("ENG-1").await.expect("state") {
            TicketState::Associated(a) => assert_eq!(a.branch_name, "feat/a"),
            other => panic!("expected Associated, got {other:?}"),
        }

        // Both occurrences, most recent first.
        let history = manager.history("ENG-1").await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(history[0].is_active);
        assert!(!history[1].is_active);
        assert!(history[0].associated_at >= history[1].associated_at);
    }

    #[tokio::test]
    async fn test_disassociate_unknown_ticket_is_noop() {
        let (manager, _git, _port) = manager_with(MockGitBackend::new());
        manager.disassociate("ENG-404").await.expect("disassociate");
    }

    #[tokio::test]
    async fn test_start_work_creates_branch_and_associates() {
        let (manager, _git, _port) = manager_with(MockGitBackend::new());

        manager.start_work("ENG-1", "feat/eng-1").await.expect("start work");

        match manager.ticket_state("ENG-1").await.expect("state") {
            TicketState::Associated(a) => assert_eq!(a.branch_name, "feat/eng-1"),
            other => panic!("expected Associated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_work_git_failure_leaves_no_association() {
        let git = MockGitBackend::new().with_failure("index locked");
        let (manager, _git, port) = manager_with(git);

        let err = manager.start_work("ENG-1", "feat/a").await.unwrap_err();
        assert!(matches!(err, BranchLinkError::Git { .. }));

        // Nothing was persisted: the store write only happens after git
        // succeeded.
        assert!(port.get(STORE_KEY).await.expect("get").is_none());
    }

    // =========================================================================
    // Safe checkout
    // =========================================================================

    #[tokio::test]
    async fn test_checkout_clean_tree_succeeds_and_touches() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        let outcome = manager
            .checkout_for_ticket("ENG-1", None)
            .await
            .expect("checkout");

        assert_eq!(
            outcome,
            CheckoutOutcome::CheckedOut {
                ticket_id: "ENG-1".to_string(),
                branch_name: "feat/a".to_string(),
                stash_message: None,
            }
        );

        let history = manager.history("ENG-1").await.expect("history");
        assert_eq!(history[0].use_count, 1);
    }

    #[tokio::test]
    async fn test_checkout_unassociated_fails() {
        let (manager, _git, _port) = manager_with(MockGitBackend::new());
        let err = manager.checkout_for_ticket("ENG-1", None).await.unwrap_err();
        assert!(matches!(err, BranchLinkError::NotAssociated { .. }));
    }

    #[tokio::test]
    async fn test_checkout_externally_deleted_branch_is_stale() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a"]);
        let (manager, git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");

        // Simulate `git branch -D feat/a` outside the manager.
        git.delete_branch("feat/a");

        let err = manager
            .checkout_for_ticket("ENG-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BranchLinkError::StaleAssociation { .. }));
    }

    #[tokio::test]
    async fn test_checkout_dirty_tree_requires_decision() {
        let git = MockGitBackend::new()
            .with_branches(["main", "feat/a"])
            .with_dirty_files(["src/lib.rs", "src/main.rs"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        let outcome = manager
            .checkout_for_ticket("ENG-1", None)
            .await
            .expect("checkout");

        let CheckoutOutcome::DecisionRequired(request) = outcome else {
            panic!("expected DecisionRequired, got {outcome:?}");
        };
        assert_eq!(request.ticket_id, "ENG-1");
        assert_eq!(request.branch_name, "feat/a");
        assert_eq!(request.changes.total, 2);
        assert_eq!(
            request.options,
            vec![
                CheckoutDecision::StashAndCheckout,
                CheckoutDecision::CheckoutAnyway,
                CheckoutDecision::Cancel,
            ]
        );
    }

    #[tokio::test]
    async fn test_checkout_cancel_touches_nothing() {
        let git = MockGitBackend::new()
            .with_branches(["main", "feat/a"])
            .with_dirty_files(["src/lib.rs"]);
        let (manager, git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        let outcome = manager
            .checkout_for_ticket("ENG-1", Some(CheckoutDecision::Cancel))
            .await
            .expect("checkout");

        assert_eq!(
            outcome,
            CheckoutOutcome::Cancelled {
                ticket_id: "ENG-1".to_string(),
                branch_name: "feat/a".to_string(),
            }
        );

        // Working tree untouched, usage untouched.
        assert!(git.checkouts().is_empty());
        assert!(git.stashes().is_empty());
        let history = manager.history("ENG-1").await.expect("history");
        assert_eq!(history[0].use_count, 0);
    }

    #[tokio::test]
    async fn test_checkout_stash_embeds_ticket_in_message() {
        let git = MockGitBackend::new()
            .with_branches(["main", "feat/a"])
            .with_dirty_files(["src/lib.rs"]);
        let (manager, git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        let outcome = manager
            .checkout_for_ticket("ENG-1", Some(CheckoutDecision::StashAndCheckout))
            .await
            .expect("checkout");

        let CheckoutOutcome::CheckedOut { stash_message, .. } = outcome else {
            panic!("expected CheckedOut, got {outcome:?}");
        };
        let message = stash_message.expect("stash message");
        assert!(message.contains("ENG-1"));

        assert_eq!(git.stashes().len(), 1);
        assert!(git.stashes()[0].contains("ENG-1"));
        assert_eq!(git.checkouts(), vec![("feat/a".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_checkout_anyway_skips_stash() {
        let git = MockGitBackend::new()
            .with_branches(["main", "feat/a"])
            .with_dirty_files(["src/lib.rs"]);
        let (manager, git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        let outcome = manager
            .checkout_for_ticket("ENG-1", Some(CheckoutDecision::CheckoutAnyway))
            .await
            .expect("checkout");

        assert!(matches!(
            outcome,
            CheckoutOutcome::CheckedOut {
                stash_message: None,
                ..
            }
        ));

        assert!(git.stashes().is_empty());
        assert_eq!(git.checkouts(), vec![("feat/a".to_string(), true)]);
    }

    // =========================================================================
    // Auto-detection
    // =========================================================================

    #[tokio::test]
    async fn test_auto_detect_finds_unassociated_candidate() {
        let git = MockGitBackend::new().with_branches(["main", "fix/ENG-5-bug"]);
        let (manager, _git, _port) = manager_with(git);

        let candidates = manager.auto_detect_associations().await.expect("detect");
        assert_eq!(
            candidates,
            vec![AutoDetectCandidate {
                ticket_id: "ENG-5".to_string(),
                branch_name: "fix/ENG-5-bug".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_auto_detect_skips_associated_branches_and_tickets() {
        let git = MockGitBackend::new().with_branches([
            "main",
            "fix/ENG-5-bug",
            "feat/ENG-6-widget",
            "feat/ENG-6-widget-v2",
        ]);
        let (manager, _git, _port) = manager_with(git);

        manager
            .associate_branch("ENG-5", "fix/ENG-5-bug")
            .await
            .expect("associate");
        manager
            .associate_branch("ENG-6", "feat/ENG-6-widget")
            .await
            .expect("associate");

        // ENG-5's branch is taken; ENG-6 already has an association, so
        // its second branch is not proposed either.
        let candidates = manager.auto_detect_associations().await.expect("detect");
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_auto_detect_groups_multiple_branches_per_ticket() {
        let git = MockGitBackend::new().with_branches(["fix/ENG-5-a", "fix/ENG-5-b", "main"]);
        let (manager, _git, _port) = manager_with(git);

        let candidates = manager.auto_detect_associations().await.expect("detect");
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.ticket_id == "ENG-5"));
        // Sorted for stable confirmation UIs.
        assert_eq!(candidates[0].branch_name, "fix/ENG-5-a");
    }

    #[tokio::test]
    async fn test_confirm_candidates_commits_with_auto_flag() {
        let git = MockGitBackend::new().with_branches(["main", "fix/ENG-5-bug"]);
        let (manager, _git, _port) = manager_with(git);

        let candidates = manager.auto_detect_associations().await.expect("detect");
        let outcome = manager.confirm_candidates(&candidates).await.expect("confirm");

        assert_eq!(outcome.confirmed.len(), 1);
        assert!(outcome.skipped.is_empty());

        match manager.ticket_state("ENG-5").await.expect("state") {
            TicketState::Associated(a) => {
                assert!(a.is_auto_detected);
                assert_eq!(a.branch_name, "fix/ENG-5-bug");
            }
            other => panic!("expected Associated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_confirm_candidates_isolates_per_item_failures() {
        let git = MockGitBackend::new().with_branches(["main", "fix/ENG-5-bug"]);
        let (manager, _git, _port) = manager_with(git);

        // ENG-7 gained an association between detection and confirmation.
        manager.associate_branch("ENG-7", "feat/other").await.expect("associate");

        let candidates = vec![
            AutoDetectCandidate {
                ticket_id: "ENG-7".to_string(),
                branch_name: "fix/ENG-7-late".to_string(),
            },
            AutoDetectCandidate {
                ticket_id: "ENG-5".to_string(),
                branch_name: "fix/ENG-5-bug".to_string(),
            },
        ];

        let outcome = manager.confirm_candidates(&candidates).await.expect("confirm");
        assert_eq!(outcome.confirmed.len(), 1);
        assert_eq!(outcome.confirmed[0].ticket_id, "ENG-5");
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].ticket_id, "ENG-7");
    }

    // =========================================================================
    // Analytics
    // =========================================================================

    #[tokio::test]
    async fn test_analytics_counts_active_and_stale() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        manager.associate_branch("ENG-2", "feat/gone").await.expect("associate");
        manager.associate_branch("ENG-3", "feat/b").await.expect("associate");
        manager.disassociate("ENG-3").await.expect("disassociate");

        let analytics = manager.analytics().await.expect("analytics");
        assert_eq!(analytics.total_tracked, 3);
        assert_eq!(analytics.active, 2);
        assert_eq!(analytics.stale, 1);
        assert!(analytics.aging.is_empty());
    }

    #[tokio::test]
    async fn test_analytics_flags_aging_associations() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a", "feat/b"]);
        let (manager, _git, port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        manager.associate_branch("ENG-2", "feat/b").await.expect("associate");
        age_ticket(&port, "ENG-1", 45).await;

        let analytics = manager.analytics().await.expect("analytics");
        assert_eq!(analytics.aging.len(), 1);
        assert_eq!(analytics.aging[0].ticket_id, "ENG-1");
        assert!(analytics.aging[0].idle_days >= 45);
    }

    #[tokio::test]
    async fn test_analytics_most_used_ranks_by_count_then_recency() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a", "feat/b"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        manager.associate_branch("ENG-2", "feat/b").await.expect("associate");

        // feat/a used twice, feat/b once (and more recently).
        manager.checkout_for_ticket("ENG-1", None).await.expect("checkout");
        manager.checkout_for_ticket("ENG-1", None).await.expect("checkout");
        manager.checkout_for_ticket("ENG-2", None).await.expect("checkout");

        let analytics = manager.analytics().await.expect("analytics");
        assert_eq!(analytics.most_used.len(), 2);
        assert_eq!(analytics.most_used[0].branch_name, "feat/a");
        assert_eq!(analytics.most_used[0].use_count, 2);
        assert_eq!(analytics.most_used[1].branch_name, "feat/b");
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    #[tokio::test]
    async fn test_cleanup_flags_stale_links() {
        let git = MockGitBackend::new().with_branches(["main"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/gone").await.expect("associate");

        let suggestions = manager.cleanup_suggestions().await.expect("suggestions");
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].kind, SuggestionKind::Stale);
        assert_eq!(suggestions[0].id, "stale:ENG-1:feat/gone");
        assert!(suggestions[0].auto_actionable());
    }

    #[tokio::test]
    async fn test_cleanup_flags_old_links() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a"]);
        let (manager, _git, port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        age_ticket(&port, "ENG-1", 31).await;

        let suggestions = manager.cleanup_suggestions().await.expect("suggestions");
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].kind, SuggestionKind::Old);
        assert!(!suggestions[0].auto_actionable());
        assert!(suggestions[0].reason.contains("unused"));
    }

    #[tokio::test]
    async fn test_cleanup_one_duplicate_suggestion_names_all_tickets() {
        let git = MockGitBackend::new().with_branches(["main", "shared-branch"]);
        let (manager, _git, _port) = manager_with(git);

        manager
            .associate_branch("ENG-2", "shared-branch")
            .await
            .expect("associate");
        manager
            .associate_branch("ENG-3", "shared-branch")
            .await
            .expect("associate");

        let suggestions = manager.cleanup_suggestions().await.expect("suggestions");
        let duplicates: Vec<_> = suggestions
            .iter()
            .filter(|s| s.kind == SuggestionKind::Duplicate)
            .collect();
        assert_eq!(duplicates.len(), 1);

        let duplicate = duplicates[0];
        assert_eq!(duplicate.ticket_id, "ENG-2");
        assert_eq!(duplicate.related_tickets, vec!["ENG-3".to_string()]);
        assert!(duplicate.reason.contains("ENG-2"));
        assert!(duplicate.reason.contains("ENG-3"));
    }

    #[tokio::test]
    async fn test_apply_cleanup_removes_stale_and_old() {
        let git = MockGitBackend::new().with_branches(["main", "feat/old"]);
        let (manager, _git, port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/gone").await.expect("associate");
        manager.associate_branch("ENG-2", "feat/old").await.expect("associate");
        age_ticket(&port, "ENG-2", 60).await;

        let report = manager
            .apply_cleanup(&[
                "stale:ENG-1:feat/gone".to_string(),
                "old:ENG-2:feat/old".to_string(),
            ])
            .await
            .expect("apply");

        assert_eq!(report.applied.len(), 2);
        assert!(report.skipped.is_empty());
        assert_eq!(
            manager.ticket_state("ENG-1").await.expect("state"),
            TicketState::Unassociated
        );
        assert_eq!(
            manager.ticket_state("ENG-2").await.expect("state"),
            TicketState::Unassociated
        );

        // History survives the soft delete.
        assert_eq!(manager.history("ENG-1").await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn test_apply_cleanup_refuses_duplicates_and_unknown_ids() {
        let git = MockGitBackend::new().with_branches(["main", "shared-branch"]);
        let (manager, _git, _port) = manager_with(git);

        manager
            .associate_branch("ENG-2", "shared-branch")
            .await
            .expect("associate");
        manager
            .associate_branch("ENG-3", "shared-branch")
            .await
            .expect("associate");

        let report = manager
            .apply_cleanup(&[
                "duplicate:shared-branch".to_string(),
                "stale:ENG-9:ghost".to_string(),
            ])
            .await
            .expect("apply");

        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped[0].reason.contains("advisory"));
        assert!(report.skipped[1].reason.contains("no longer applies"));

        // Both associations survive untouched.
        assert_eq!(manager.all_associations().await.expect("all").len(), 2);
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    #[tokio::test]
    async fn test_single_active_entry_invariant_under_churn() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a", "feat/b"]);
        let (manager, _git, _port) = manager_with(git);

        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");
        manager.associate_branch("ENG-1", "feat/b").await.expect("associate");
        manager.checkout_for_ticket("ENG-1", None).await.expect("checkout");
        manager.disassociate("ENG-1").await.expect("disassociate");
        manager.associate_branch("ENG-1", "feat/a").await.expect("associate");

        let history = manager.history("ENG-1").await.expect("history");
        assert_eq!(history.iter().filter(|e| e.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_serialize_per_ticket() {
        let git = MockGitBackend::new().with_branches(["main", "feat/a", "feat/b"]);
        let (manager, _git, _port) = manager_with(git);
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            let branch = if i % 2 == 0 { "feat/a" } else { "feat/b" };
            handles.push(tokio::spawn(async move {
                manager.associate_branch("ENG-1", branch).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("associate");
        }

        let history = manager.history("ENG-1").await.expect("history");
        assert_eq!(history.iter().filter(|e| e.is_active).count(), 1);
    }
}
