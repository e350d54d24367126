//! Persistent branch-association storage.
//!
//! Associations live in a single JSON document held behind an injected
//! key-value port (the host supplies durable workspace-scoped storage;
//! no singletons). Every mutation rewrites the whole document through
//! the port in one atomic replace, so a retry after a crash mid-write is
//! idempotent. History entries are never physically deleted: supersede
//! and disassociate only flip `is_active`.

pub mod persistence;

pub use persistence::FileKeyValuePort;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BranchLinkError, Result};

/// Key the association document is stored under.
pub const STORE_KEY: &str = "branchlink.associations";

/// Document schema version.
const DOCUMENT_VERSION: u32 = 1;

/// Backoff before the single store-I/O retry.
const RETRY_BACKOFF_MS: u64 = 150;

/// Durable workspace-scoped key-value persistence substrate.
///
/// Injected into the store by the host. Implementations must make
/// `set` atomic: a crashed write may lose the update but must never
/// leave a torn value behind.
#[async_trait]
pub trait KeyValuePort: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Atomically replace the value stored under `key`.
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Remove the value stored under `key`. Removing a missing key is
    /// not an error.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// The current, non-superseded branch linked to a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchAssociation {
    pub ticket_id: String,
    pub branch_name: String,
    /// When the association itself last changed (created or superseded).
    pub last_updated: DateTime<Utc>,
    /// Whether this link came from confirmed auto-detection rather than
    /// an explicit associate call.
    pub is_auto_detected: bool,
}

/// Audit record of a branch ever linked to a ticket.
///
/// Immutable once appended, except for `is_active`, `last_used`, and the
/// `use_count` that increments alongside each `last_used` touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub branch_name: String,
    pub associated_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub use_count: u64,
}

/// Everything the store knows about one ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Active association, if any. Present iff exactly one history entry
    /// is active.
    pub association: Option<BranchAssociation>,
    /// Timeline of every branch ever linked, in association order.
    pub history: Vec<HistoryEntry>,
}

/// Read-only snapshot of one ticket, for analytics and cleanup.
#[derive(Debug, Clone)]
pub struct TicketSnapshot {
    pub ticket_id: String,
    pub association: Option<BranchAssociation>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    tickets: BTreeMap<String, TicketRecord>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            tickets: BTreeMap::new(),
        }
    }
}

/// Persistent mapping of ticket id to active association plus an
/// append-mostly historical timeline per ticket.
pub struct AssociationStore {
    port: Arc<dyn KeyValuePort>,
}

impl AssociationStore {
    /// Create a store over the given persistence port.
    pub fn new(port: Arc<dyn KeyValuePort>) -> Self {
        Self { port }
    }

    /// Current association for a ticket, or `None`.
    pub async fn get(&self, ticket_id: &str) -> Result<Option<BranchAssociation>> {
        let doc = self.load_document().await?;
        Ok(doc
            .tickets
            .get(ticket_id)
            .and_then(|r| r.association.clone()))
    }

    /// Upsert the association for a ticket.
    ///
    /// Demotes any prior active history entry and appends a new entry
    /// for `branch_name`. Re-associating the already-active branch is
    /// idempotent: the active entry is refreshed in place instead of
    /// duplicated.
    pub async fn set(
        &self,
        ticket_id: &str,
        branch_name: &str,
        is_auto_detected: bool,
    ) -> Result<BranchAssociation> {
        let now = Utc::now();
        let mut doc = self.load_document().await?;
        let record = doc.tickets.entry(ticket_id.to_string()).or_default();

        let association = BranchAssociation {
            ticket_id: ticket_id.to_string(),
            branch_name: branch_name.to_string(),
            last_updated: now,
            is_auto_detected,
        };

        let refreshed_in_place = match record.history.iter_mut().find(|e| e.is_active) {
            Some(active) if active.branch_name == branch_name => {
                active.last_used = now;
                true
            }
            Some(active) => {
                active.is_active = false;
                false
            }
            None => false,
        };

        if !refreshed_in_place {
            record.history.push(HistoryEntry {
                branch_name: branch_name.to_string(),
                associated_at: now,
                last_used: now,
                is_active: true,
                use_count: 0,
            });
        }

        record.association = Some(association.clone());
        self.persist_document(&doc).await?;
        debug!(ticket_id, branch_name, is_auto_detected, "association set");
        Ok(association)
    }

    /// Soft-delete the association for a ticket.
    ///
    /// The active history entry is marked inactive; the timeline is
    /// retained. Removing an unassociated ticket is a no-op.
    pub async fn remove(&self, ticket_id: &str) -> Result<()> {
        let mut doc = self.load_document().await?;
        let Some(record) = doc.tickets.get_mut(ticket_id) else {
            return Ok(());
        };

        if record.association.is_none() {
            return Ok(());
        }

        for entry in record.history.iter_mut().filter(|e| e.is_active) {
            entry.is_active = false;
        }
        record.association = None;

        self.persist_document(&doc).await?;
        debug!(ticket_id, "association removed");
        Ok(())
    }

    /// Bump `last_used` and `use_count` on the active entry for a
    /// ticket. Called on every successful checkout.
    ///
    /// # Errors
    ///
    /// Returns `NotAssociated` if the ticket has no active association.
    pub async fn touch(&self, ticket_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut doc = self.load_document().await?;

        let active = doc
            .tickets
            .get_mut(ticket_id)
            .and_then(|r| r.history.iter_mut().find(|e| e.is_active))
            .ok_or_else(|| BranchLinkError::not_associated(ticket_id))?;

        active.last_used = now;
        active.use_count += 1;

        self.persist_document(&doc).await?;
        Ok(())
    }

    /// Current active mapping of ticket id to association.
    pub async fn all_associations(&self) -> Result<BTreeMap<String, BranchAssociation>> {
        let doc = self.load_document().await?;
        Ok(doc
            .tickets
            .iter()
            .filter_map(|(id, r)| r.association.clone().map(|a| (id.clone(), a)))
            .collect())
    }

    /// Full timeline for a ticket, most-recent-first.
    pub async fn history_for(&self, ticket_id: &str) -> Result<Vec<HistoryEntry>> {
        let doc = self.load_document().await?;
        let mut history = doc
            .tickets
            .get(ticket_id)
            .map(|r| r.history.clone())
            .unwrap_or_default();
        // Entries are appended in association order, so reversing yields
        // most-recent-first even when timestamps collide.
        history.reverse();
        Ok(history)
    }

    /// Snapshot of every tracked ticket, for analytics and cleanup.
    pub async fn snapshot(&self) -> Result<Vec<TicketSnapshot>> {
        let doc = self.load_document().await?;
        Ok(doc
            .tickets
            .into_iter()
            .map(|(ticket_id, record)| TicketSnapshot {
                ticket_id,
                association: record.association,
                history: record.history,
            })
            .collect())
    }

    // =========================================================================
    // Document plumbing
    // =========================================================================

    async fn load_document(&self) -> Result<StoreDocument> {
        let raw = self.get_with_retry().await?;

        let Some(raw) = raw else {
            return Ok(StoreDocument::default());
        };

        let doc: StoreDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("corrupted association document, starting fresh: {e}");
                return Ok(StoreDocument::default());
            }
        };

        if doc.version != DOCUMENT_VERSION {
            warn!(
                found = doc.version,
                supported = DOCUMENT_VERSION,
                "incompatible association document version, starting fresh"
            );
            return Ok(StoreDocument::default());
        }

        Ok(doc)
    }

    async fn persist_document(&self, doc: &StoreDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)?;
        self.set_with_retry(&json).await
    }

    async fn get_with_retry(&self) -> Result<Option<String>> {
        match self.port.get(STORE_KEY).await {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!("store read failed, retrying once: {first}");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                self.port
                    .get(STORE_KEY)
                    .await
                    .map_err(|e| BranchLinkError::store_io(e.to_string()))
            }
        }
    }

    async fn set_with_retry(&self, value: &str) -> Result<()> {
        match self.port.set(STORE_KEY, value).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("store write failed, retrying once: {first}");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                self.port
                    .set(STORE_KEY, value)
                    .await
                    .map_err(|e| BranchLinkError::store_io(e.to_string()))
            }
        }
    }
}
