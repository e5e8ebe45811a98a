//! Data model for the mirror engine.
//!
//! Wire-level items ([`RemoteItem`], [`DeltaPage`]) come from the remote
//! tree service; persisted counterparts ([`MirrorRecord`], [`SyncLogEntry`],
//! [`DeltaCheckpoint`]) live in the local store. [`SessionMetrics`] is
//! in-memory only and scoped to a single sync run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote container (a hierarchical namespace of items, e.g. a drive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Stable container identifier.
    pub id: String,
    /// Human-readable name, when the service provides one.
    pub name: Option<String>,
}

/// One item as reported by the remote tree service.
///
/// Not persisted as-is; [`MirrorRecord`] is the stored counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Globally unique, stable across syncs.
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub last_modified: DateTime<Utc>,
    /// `None` marks the container root.
    pub parent_path: Option<String>,
    /// Version tag, opaque to the engine.
    pub etag: Option<String>,
    /// Deletion marker (tombstone) within a delta page.
    pub deleted: bool,
}

/// Persisted mirror row, keyed by remote id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub last_modified: DateTime<Utc>,
    pub parent_path: Option<String>,
    pub etag: Option<String>,
    pub downloaded: bool,
}

impl MirrorRecord {
    /// A record with no parent path is the container root.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_path.is_none()
    }

    /// The path under which this record's children are keyed.
    ///
    /// Children of the root live under `/`; children of a folder live
    /// under the folder's own slash-joined path.
    #[must_use]
    pub fn item_path(&self) -> String {
        match self.parent_path.as_deref() {
            None => "/".to_string(),
            Some("/") => format!("/{}", self.name),
            Some(parent) => format!("{parent}/{}", self.name),
        }
    }
}

impl From<&RemoteItem> for MirrorRecord {
    fn from(item: &RemoteItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            is_folder: item.is_folder,
            last_modified: item.last_modified,
            parent_path: item.parent_path.clone(),
            etag: item.etag.clone(),
            downloaded: false,
        }
    }
}

/// One page of a delta query.
///
/// Exactly one of the two links is expected per page: `next_page_link`
/// means more pages are pending (not a valid resume point yet),
/// `delta_link` means this response is fully caught up and is the new
/// durable checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPage {
    pub items: Vec<RemoteItem>,
    pub next_page_link: Option<String>,
    pub delta_link: Option<String>,
}

/// One atomically-applied unit of work for the store.
#[derive(Debug, Clone)]
pub struct ItemBatch {
    pub container_id: String,
    pub upserts: Vec<RemoteItem>,
    /// Ids of tombstoned items.
    pub tombstones: Vec<String>,
    /// Candidate checkpoint token carried alongside the batch, so
    /// checkpoint advancement commits atomically with the content.
    pub token: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Counts reported by one `apply_batch` call.
///
/// Counting policy: every successful upsert increments `inserted`;
/// `updated` is reported but never computed (a true update count would
/// need a pre-read per item). `deleted` only counts rows that existed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Durable resume point for one container. At most one row per container;
/// writes are last-write-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaCheckpoint {
    pub container_id: String,
    /// Opaque continuation token, independently sufficient to resume.
    pub token: String,
    pub last_synced: DateTime<Utc>,
}

/// Append-only audit row, one per applied batch. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub container_id: String,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub token: Option<String>,
    pub last_synced: DateTime<Utc>,
}

/// Aggregate over recent sync log rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncLogSummary {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub runs: u64,
}

/// Running totals for one sync session. In-memory only; dropped with the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub run_id: Uuid,
    pub pages: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl SessionMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            pages: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
        }
    }

    pub fn accumulate(&mut self, counts: BatchCounts) {
        self.pages += 1;
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.deleted += counts.deleted;
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal state of one `run_sync` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The session ran to completion over all delta pages.
    Completed(SessionMetrics),
    /// The container reference did not resolve; nothing was done.
    /// This is a reported status, not an error.
    NoContainer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(name: &str, parent: Option<&str>) -> MirrorRecord {
        MirrorRecord {
            id: format!("id-{name}"),
            name: name.to_string(),
            is_folder: true,
            last_modified: Utc::now(),
            parent_path: parent.map(ToString::to_string),
            etag: None,
            downloaded: false,
        }
    }

    #[test]
    fn root_record_has_root_item_path() {
        let root = record("root", None);
        assert!(root.is_root());
        assert_eq!(root.item_path(), "/");
    }

    #[test]
    fn item_path_joins_without_double_slash() {
        assert_eq!(record("photos", Some("/")).item_path(), "/photos");
        assert_eq!(
            record("2024", Some("/photos")).item_path(),
            "/photos/2024"
        );
    }

    #[test]
    fn mirror_record_from_remote_item_starts_undownloaded() {
        let item = RemoteItem {
            id: "a1".to_string(),
            name: "report.pdf".to_string(),
            is_folder: false,
            last_modified: Utc::now(),
            parent_path: Some("/".to_string()),
            etag: Some("v1".to_string()),
            deleted: false,
        };
        let rec = MirrorRecord::from(&item);
        assert_eq!(rec.id, "a1");
        assert!(!rec.downloaded);
    }

    #[test]
    fn session_metrics_accumulates_batches() {
        let mut metrics = SessionMetrics::new();
        metrics.accumulate(BatchCounts {
            inserted: 2,
            updated: 0,
            deleted: 0,
        });
        metrics.accumulate(BatchCounts {
            inserted: 0,
            updated: 0,
            deleted: 1,
        });
        assert_eq!(metrics.pages, 2);
        assert_eq!(metrics.inserted, 2);
        assert_eq!(metrics.deleted, 1);
    }
}
