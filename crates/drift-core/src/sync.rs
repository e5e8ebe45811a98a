//! Incremental sync orchestrator.
//!
//! Drives one sync session: resolves the target container, chooses the
//! full or resumed path based on the saved checkpoint, pages through the
//! remote delta protocol, and applies each page to the mirror store as
//! one atomic batch. Retries live with the remote collaborator, never
//! here; a failed session simply resumes from the last committed
//! checkpoint on the next invocation.

use std::sync::Arc;

use chrono::Utc;

use crate::cancel::CancelToken;
use crate::db::MirrorStore;
use crate::error::Result;
use crate::models::{BatchCounts, ItemBatch, SessionMetrics, SyncOutcome};
use crate::progress::StatusSink;
use crate::remote::RemoteTree;

pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteTree>,
    store: MirrorStore,
    sink: Arc<dyn StatusSink>,
}

impl SyncOrchestrator {
    pub fn new(remote: Arc<dyn RemoteTree>, store: MirrorStore, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            remote,
            store,
            sink,
        }
    }

    /// Run one sync session for `container_ref`.
    ///
    /// An unresolvable container ends the session cleanly with
    /// [`SyncOutcome::NoContainer`]; remote errors propagate to the
    /// caller. Each page commits independently, so a failure or
    /// cancellation mid-loop leaves the store exactly at the last
    /// fully-applied page.
    pub async fn run_sync(&self, container_ref: &str, cancel: &CancelToken) -> Result<SyncOutcome> {
        cancel.check()?;

        let Some(container) = self.remote.resolve_container(container_ref).await? else {
            tracing::info!(container_ref, "No matching container; nothing to sync");
            self.sink
                .status(&format!("no container matches '{container_ref}'"), None);
            return Ok(SyncOutcome::NoContainer);
        };

        let checkpoint = self.store.checkpoint(&container.id).await?;
        // The saved token doubles as the first cursor on the resume path.
        let mut candidate_token = checkpoint.map(|cp| cp.token);
        let mut cursor = candidate_token.clone();

        tracing::info!(
            container = %container.id,
            resumed = cursor.is_some(),
            "Starting sync session"
        );
        self.sink.status(
            if cursor.is_some() {
                "resuming from saved checkpoint"
            } else {
                "starting full sync"
            },
            None,
        );

        let mut metrics = SessionMetrics::new();

        loop {
            cancel.check()?;

            let page = self
                .remote
                .delta_page(&container.id, cursor.as_deref())
                .await?;

            // A delta link means this page is fully caught up and is the
            // new durable resume point; otherwise keep the previous one.
            if let Some(delta_link) = &page.delta_link {
                candidate_token = Some(delta_link.clone());
            }

            let (upserts, tombstones): (Vec<_>, Vec<_>) =
                page.items.iter().cloned().partition(|item| !item.deleted);
            let tombstones: Vec<String> = tombstones.into_iter().map(|item| item.id).collect();

            // An empty page leaves no audit row; only its token (if any)
            // is worth keeping.
            let counts = if upserts.is_empty() && tombstones.is_empty() {
                if let Some(token) = &candidate_token {
                    self.store
                        .save_checkpoint(&container.id, token, Utc::now())
                        .await?;
                }
                BatchCounts::default()
            } else {
                self.store
                    .apply_batch(&ItemBatch {
                        container_id: container.id.clone(),
                        upserts,
                        tombstones,
                        token: candidate_token.clone(),
                        timestamp: Utc::now(),
                    })
                    .await?
            };
            metrics.accumulate(counts);

            self.sink.status(
                &format!(
                    "page {}: +{} items, -{} items",
                    metrics.pages, counts.inserted, counts.deleted
                ),
                None,
            );

            match page.next_page_link {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(
            run_id = %metrics.run_id,
            pages = metrics.pages,
            inserted = metrics.inserted,
            deleted = metrics.deleted,
            "Sync session completed"
        );
        self.sink.status(
            &format!(
                "sync complete: {} pages, {} upserts, {} deletes",
                metrics.pages, metrics.inserted, metrics.deleted
            ),
            None,
        );

        Ok(SyncOutcome::Completed(metrics))
    }
}
