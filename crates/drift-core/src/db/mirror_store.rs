//! Mirror store: the durable local representation of remote item
//! metadata, per-container checkpoints, and the append-only sync log.

use chrono::{DateTime, Duration, Utc};
use libsql::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{
    BatchCounts, DeltaCheckpoint, ItemBatch, MirrorRecord, SyncLogEntry, SyncLogSummary,
};

/// Cheap-clone handle over the mirror database.
///
/// Every logical operation runs in its own short-lived transaction (or a
/// single statement for reads); there is no application-level lock.
/// Write-write overlap between the orchestrator and in-flight download
/// tasks is resolved by `SQLite`'s own isolation.
#[derive(Clone)]
pub struct MirrorStore {
    conn: Connection,
}

impl MirrorStore {
    /// Create a store handle over an already-migrated connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Apply one batch of upserts and tombstones atomically, together
    /// with the checkpoint advance and exactly one sync log row.
    ///
    /// Each upsert insert-or-fully-replaces its row by id; a tombstone
    /// for an absent row is a no-op. The checkpoint upsert is skipped
    /// when the batch carries no candidate token (initial full-sync
    /// pages before the first delta link). Any failure rolls the whole
    /// batch back.
    ///
    /// Counting policy: every successful upsert counts as `inserted`
    /// and `updated` stays zero; a true split would need a pre-read per
    /// item. `deleted` only counts rows that actually existed.
    pub async fn apply_batch(&self, batch: &ItemBatch) -> Result<BatchCounts> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        match self.apply_batch_inner(batch).await {
            Ok(counts) => {
                self.conn.execute("COMMIT", ()).await?;
                tracing::debug!(
                    container = %batch.container_id,
                    inserted = counts.inserted,
                    deleted = counts.deleted,
                    has_token = batch.token.is_some(),
                    "Applied sync batch"
                );
                Ok(counts)
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn apply_batch_inner(&self, batch: &ItemBatch) -> Result<BatchCounts> {
        let mut counts = BatchCounts::default();

        for item in &batch.upserts {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO items
                     (id, name, is_folder, last_modified_utc, parent_path, etag, downloaded)
                     VALUES (?, ?, ?, ?, ?, ?, 0)",
                    params![
                        item.id.as_str(),
                        item.name.as_str(),
                        i64::from(item.is_folder),
                        item.last_modified.timestamp_millis(),
                        item.parent_path.clone(),
                        item.etag.clone(),
                    ],
                )
                .await?;
            counts.inserted += 1;
        }

        for id in &batch.tombstones {
            let rows = self
                .conn
                .execute("DELETE FROM items WHERE id = ?", [id.as_str()])
                .await?;
            if rows > 0 {
                counts.deleted += 1;
            }
        }

        if let Some(token) = &batch.token {
            self.upsert_checkpoint(&batch.container_id, token, batch.timestamp)
                .await?;
        }

        self.conn
            .execute(
                "INSERT INTO sync_log
                 (container_id, inserted, updated, deleted, token, last_synced_utc)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    batch.container_id.as_str(),
                    to_i64(counts.inserted)?,
                    to_i64(counts.updated)?,
                    to_i64(counts.deleted)?,
                    batch.token.clone(),
                    batch.timestamp.timestamp_millis(),
                ],
            )
            .await?;

        Ok(counts)
    }

    /// Upsert a container's resume point on its own, outside a batch.
    ///
    /// Used for pages that carry a new token but no content; applied
    /// batches advance the checkpoint through [`Self::apply_batch`]
    /// instead, atomically with their items.
    pub async fn save_checkpoint(
        &self,
        container_id: &str,
        token: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.upsert_checkpoint(container_id, token, timestamp).await
    }

    /// Single checkpoint write statement shared by both write paths.
    async fn upsert_checkpoint(
        &self,
        container_id: &str,
        token: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO checkpoint (container_id, token, last_synced_utc)
                 VALUES (?, ?, ?)",
                params![container_id, token, timestamp.timestamp_millis()],
            )
            .await?;
        Ok(())
    }

    /// Flip the downloaded flag for a batch of item ids, in one transaction
    pub async fn mark_downloaded(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        let mut marked = 0;
        for id in ids {
            let result = self
                .conn
                .execute("UPDATE items SET downloaded = 1 WHERE id = ?", [id.as_str()])
                .await;
            match result {
                Ok(rows) => marked += rows,
                Err(e) => {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    return Err(e.into());
                }
            }
        }

        self.conn.execute("COMMIT", ()).await?;
        tracing::debug!(marked, "Marked items downloaded");
        Ok(marked)
    }

    /// The saved resume point for a container, if any
    pub async fn checkpoint(&self, container_id: &str) -> Result<Option<DeltaCheckpoint>> {
        let mut rows = self
            .conn
            .query(
                "SELECT container_id, token, last_synced_utc FROM checkpoint WHERE container_id = ?",
                [container_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        Ok(Some(DeltaCheckpoint {
            container_id: row.get::<String>(0)?,
            token: row.get::<String>(1)?,
            last_synced: millis_to_utc(row.get::<i64>(2)?)?,
        }))
    }

    /// Fetch one record by remote id
    pub async fn item(&self, id: &str) -> Result<Option<MirrorRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                 FROM items WHERE id = ?",
                [id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// The container root: the single record with no parent path
    pub async fn root(&self) -> Result<Option<MirrorRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                 FROM items WHERE parent_path IS NULL LIMIT 1",
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Children of a parent path, optionally only those modified after
    /// `modified_since`, folders first then by name
    pub async fn children(
        &self,
        parent_path: &str,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MirrorRecord>> {
        let mut rows = match modified_since {
            Some(since) => {
                self.conn
                    .query(
                        "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                         FROM items
                         WHERE parent_path = ? AND last_modified_utc > ?
                         ORDER BY is_folder DESC, name ASC",
                        params![parent_path, since.timestamp_millis()],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                         FROM items
                         WHERE parent_path = ?
                         ORDER BY is_folder DESC, name ASC",
                        [parent_path],
                    )
                    .await?
            }
        };

        collect_records(&mut rows).await
    }

    /// Substring search by name within one parent path
    pub async fn search(&self, parent_path: &str, needle: &str) -> Result<Vec<MirrorRecord>> {
        let pattern = format!("%{needle}%");
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                 FROM items
                 WHERE parent_path = ? AND name LIKE ?
                 ORDER BY name ASC",
                params![parent_path, pattern],
            )
            .await?;

        collect_records(&mut rows).await
    }

    /// Number of file-kind records in the mirror
    pub async fn file_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM items WHERE is_folder = 0", ())
            .await?;

        match rows.next().await? {
            Some(row) => Ok(from_i64(row.get::<i64>(0)?)),
            None => Ok(0),
        }
    }

    /// All folder-kind records
    pub async fn folders(&self) -> Result<Vec<MirrorRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                 FROM items WHERE is_folder = 1 ORDER BY parent_path ASC, name ASC",
                (),
            )
            .await?;

        collect_records(&mut rows).await
    }

    /// All file-kind records modified since the given timestamp
    pub async fn files_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<MirrorRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, is_folder, last_modified_utc, parent_path, etag, downloaded
                 FROM items
                 WHERE is_folder = 0 AND last_modified_utc > ?
                 ORDER BY last_modified_utc DESC",
                [since.timestamp_millis()],
            )
            .await?;

        collect_records(&mut rows).await
    }

    /// The `limit` most recent sync log rows, newest first
    pub async fn recent_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, container_id, inserted, updated, deleted, token, last_synced_utc
                 FROM sync_log ORDER BY id DESC LIMIT ?",
                [to_i64(limit as u64)?],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(SyncLogEntry {
                id: row.get::<i64>(0)?,
                container_id: row.get::<String>(1)?,
                inserted: from_i64(row.get::<i64>(2)?),
                updated: from_i64(row.get::<i64>(3)?),
                deleted: from_i64(row.get::<i64>(4)?),
                token: row.get::<Option<String>>(5)?,
                last_synced: millis_to_utc(row.get::<i64>(6)?)?,
            });
        }

        Ok(entries)
    }

    /// Aggregate counts over sync log rows newer than `max_age`
    pub async fn log_summary(&self, max_age: Duration) -> Result<SyncLogSummary> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(inserted), 0), COALESCE(SUM(updated), 0),
                        COALESCE(SUM(deleted), 0), COUNT(*)
                 FROM sync_log WHERE last_synced_utc > ?",
                [cutoff],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(SyncLogSummary::default());
        };

        Ok(SyncLogSummary {
            inserted: from_i64(row.get::<i64>(0)?),
            updated: from_i64(row.get::<i64>(1)?),
            deleted: from_i64(row.get::<i64>(2)?),
            runs: from_i64(row.get::<i64>(3)?),
        })
    }
}

async fn collect_records(rows: &mut libsql::Rows) -> Result<Vec<MirrorRecord>> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().await? {
        records.push(record_from_row(&row)?);
    }
    Ok(records)
}

fn record_from_row(row: &libsql::Row) -> Result<MirrorRecord> {
    Ok(MirrorRecord {
        id: row.get::<String>(0)?,
        name: row.get::<String>(1)?,
        is_folder: row.get::<i64>(2)? != 0,
        last_modified: millis_to_utc(row.get::<i64>(3)?)?,
        parent_path: row.get::<Option<String>>(4)?,
        etag: row.get::<Option<String>>(5)?,
        downloaded: row.get::<i64>(6)? != 0,
    })
}

fn millis_to_utc(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Database(format!("timestamp out of range: {millis}")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Database(format!("count out of range: {value}")))
}

#[allow(clippy::cast_sign_loss)] // counts are written non-negative
const fn from_i64(value: i64) -> u64 {
    if value < 0 {
        0
    } else {
        value as u64
    }
}
