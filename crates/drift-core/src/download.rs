//! Concurrent content downloader.
//!
//! Walks the mirrored tree depth-first, creating destination folders as
//! it goes, and fans file fetches out over a bounded set of tokio tasks.
//! A single file failure is recorded and the run continues; only store
//! and traversal errors abort the whole run.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::db::MirrorStore;
use crate::error::{Error, Result};
use crate::models::{ItemBatch, MirrorRecord};
use crate::progress::{MetricsCollector, ProgressReporter};
use crate::remote::{RemoteError, RemoteResult, RemoteTree};

/// Services sometimes report a just-listed item as missing; one delayed
/// retry covers that window.
const NOT_FOUND_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Upper bound on concurrent content fetches.
    pub max_parallelism: usize,
    /// How many completed ids to buffer before flushing downloaded
    /// flags to the store.
    pub batch_size: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            batch_size: 25,
        }
    }
}

/// Per-run shared state for the spawned file tasks.
struct RunContext {
    semaphore: Arc<Semaphore>,
    pending: Arc<Mutex<Vec<String>>>,
    batch_size: usize,
}

pub struct Downloader {
    remote: Arc<dyn RemoteTree>,
    store: MirrorStore,
    metrics: Arc<MetricsCollector>,
    reporter: Option<Arc<ProgressReporter>>,
}

impl Downloader {
    pub fn new(remote: Arc<dyn RemoteTree>, store: MirrorStore, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            remote,
            store,
            metrics,
            reporter: None,
        }
    }

    /// Attach a throttled status reporter. Without one the run is silent.
    #[must_use]
    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Mirror every file under the container root into `destination_root`.
    ///
    /// An empty mirror is bootstrapped from a full remote listing first.
    /// All spawned tasks are awaited before this returns, including on
    /// the error and cancellation paths, and buffered downloaded flags
    /// are flushed to the store.
    pub async fn download_all(
        &self,
        container_id: &str,
        destination_root: &Path,
        options: &DownloadOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;

        let root = match self.store.root().await? {
            Some(root) => root,
            None => self.bootstrap(container_id).await?,
        };

        let total = self.store.file_count().await?;
        self.metrics.set_total_files(total);
        tracing::info!(
            container = container_id,
            total_files = total,
            parallelism = options.max_parallelism,
            "Starting download run"
        );

        tokio::fs::create_dir_all(destination_root).await?;

        let ctx = RunContext {
            semaphore: Arc::new(Semaphore::new(options.max_parallelism.max(1))),
            pending: Arc::new(Mutex::new(Vec::new())),
            batch_size: options.batch_size.max(1),
        };

        let mut tasks = JoinSet::new();
        let walk_result = self
            .walk(
                root.item_path(),
                destination_root.to_path_buf(),
                &ctx,
                &mut tasks,
                cancel,
            )
            .await;

        // Drain the whole set even when the walk failed, so no task
        // outlives the run.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Download task aborted");
                self.metrics.record_error();
            }
        }

        let remainder = ctx
            .pending
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default();
        self.store.mark_downloaded(&remainder).await?;

        if let Some(reporter) = &self.reporter {
            reporter.flush(&self.metrics);
        }

        walk_result?;

        tracing::info!(
            files = self.metrics.files(),
            bytes = self.metrics.bytes(),
            errors = self.metrics.errors(),
            "Download run finished"
        );
        Ok(())
    }

    /// Fill an empty mirror from a breadth-first remote listing.
    async fn bootstrap(&self, container_id: &str) -> Result<MirrorRecord> {
        tracing::info!(container = container_id, "Mirror is empty; bootstrapping from remote listing");

        let root = self.remote.root_item(container_id).await?;
        self.store
            .apply_batch(&ItemBatch {
                container_id: container_id.to_string(),
                upserts: vec![root.clone()],
                tombstones: vec![],
                token: None,
                timestamp: Utc::now(),
            })
            .await?;

        let mut queue = VecDeque::from([root.id.clone()]);
        while let Some(folder_id) = queue.pop_front() {
            let children = self.remote.list_children(&folder_id).await?;
            if children.is_empty() {
                continue;
            }
            for child in &children {
                if child.is_folder {
                    queue.push_back(child.id.clone());
                }
            }
            self.store
                .apply_batch(&ItemBatch {
                    container_id: container_id.to_string(),
                    upserts: children,
                    tombstones: vec![],
                    token: None,
                    timestamp: Utc::now(),
                })
                .await?;
        }

        Ok(MirrorRecord::from(&root))
    }

    /// Depth-first traversal: folders are created inline, files are
    /// handed to the task set once a semaphore permit is held, so the
    /// walk itself backpressures at `max_parallelism`.
    fn walk<'a>(
        &'a self,
        parent_path: String,
        dest_dir: PathBuf,
        ctx: &'a RunContext,
        tasks: &'a mut JoinSet<()>,
        cancel: &'a CancelToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            cancel.check()?;

            let children = self.store.children(&parent_path, None).await?;
            for child in children {
                cancel.check()?;

                if child.is_folder {
                    let dir = dest_dir.join(&child.name);
                    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                        tracing::warn!(folder = %child.name, error = %e, "Failed to create destination folder; skipping subtree");
                        self.metrics.record_error();
                        continue;
                    }
                    self.walk(child.item_path(), dir, ctx, &mut *tasks, cancel)
                        .await?;
                    continue;
                }

                // The semaphore is never closed, so acquisition only
                // fails if the run is being torn down.
                let permit = Arc::clone(&ctx.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?;

                let remote = Arc::clone(&self.remote);
                let store = self.store.clone();
                let metrics = Arc::clone(&self.metrics);
                let reporter = self.reporter.clone();
                let pending = Arc::clone(&ctx.pending);
                let batch_size = ctx.batch_size;
                let cancel = cancel.clone();
                let dest_dir = dest_dir.clone();
                let id = child.id;
                let name = child.name;

                tasks.spawn(async move {
                    let _permit = permit;
                    if cancel.is_cancelled() {
                        return;
                    }

                    let bytes = match fetch_with_retry(remote.as_ref(), &id).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(item = %id, error = %e, "Content download failed");
                            metrics.record_error();
                            return;
                        }
                    };

                    let target = dest_dir.join(&name);
                    if let Err(e) = tokio::fs::write(&target, &bytes).await {
                        tracing::warn!(item = %id, error = %e, "Failed to write file");
                        metrics.record_error();
                        return;
                    }

                    metrics.record_file(&dest_dir.display().to_string(), bytes.len() as u64);

                    let flush = pending.lock().ok().and_then(|mut queue| {
                        queue.push(id);
                        (queue.len() >= batch_size).then(|| std::mem::take(&mut *queue))
                    });
                    if let Some(ids) = flush {
                        if let Err(e) = store.mark_downloaded(&ids).await {
                            tracing::warn!(error = %e, "Failed to persist downloaded flags");
                            metrics.record_error();
                        }
                    }

                    if let Some(reporter) = &reporter {
                        reporter.maybe_report(&metrics);
                    }
                });
            }

            Ok(())
        })
    }

}

/// One fetch with a single delayed retry on `NotFound`.
async fn fetch_with_retry(remote: &dyn RemoteTree, item_id: &str) -> RemoteResult<Vec<u8>> {
    match remote.download_content(item_id).await {
        Err(RemoteError::NotFound(_)) => {
            tracing::debug!(item = item_id, "Content not found; retrying once");
            tokio::time::sleep(NOT_FOUND_RETRY_DELAY).await;
            remote.download_content(item_id).await
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::RemoteItem;
    use crate::testing::FakeRemote;
    use pretty_assertions::assert_eq;

    fn file(id: &str, name: &str, parent: &str) -> RemoteItem {
        RemoteItem {
            id: id.to_string(),
            name: name.to_string(),
            is_folder: false,
            last_modified: Utc::now(),
            parent_path: Some(parent.to_string()),
            etag: None,
            deleted: false,
        }
    }

    fn folder(id: &str, name: &str, parent: &str) -> RemoteItem {
        RemoteItem {
            is_folder: true,
            ..file(id, name, parent)
        }
    }

    fn root_item() -> RemoteItem {
        RemoteItem {
            id: "root".to_string(),
            name: "root".to_string(),
            is_folder: true,
            last_modified: Utc::now(),
            parent_path: None,
            etag: None,
            deleted: false,
        }
    }

    async fn seeded_store(items: Vec<RemoteItem>) -> (Database, MirrorStore) {
        let db = Database::open_in_memory().await.unwrap();
        let store = MirrorStore::new(db.connection().clone());
        let mut upserts = vec![root_item()];
        upserts.extend(items);
        store
            .apply_batch(&ItemBatch {
                container_id: "drive-1".to_string(),
                upserts,
                tombstones: vec![],
                token: Some("delta-1".to_string()),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        (db, store)
    }

    fn downloader(remote: Arc<FakeRemote>, store: MirrorStore) -> Downloader {
        Downloader::new(remote, store, Arc::new(MetricsCollector::new()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mirrors_a_nested_tree_to_disk() {
        let remote = Arc::new(FakeRemote::new("drive-1"));
        remote.add_content("f1", b"top");
        remote.add_content("f2", b"nested");
        let (_db, store) = seeded_store(vec![
            file("f1", "readme.txt", "/"),
            folder("d1", "photos", "/"),
            file("f2", "cat.jpg", "/photos"),
        ])
        .await;

        let dest = tempfile::tempdir().unwrap();
        downloader(Arc::clone(&remote), store.clone())
            .download_all(
                "drive-1",
                dest.path(),
                &DownloadOptions::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(dest.path().join("readme.txt")).await.unwrap(),
            b"top"
        );
        assert_eq!(
            tokio::fs::read(dest.path().join("photos").join("cat.jpg"))
                .await
                .unwrap(),
            b"nested"
        );
        assert!(store.item("f1").await.unwrap().unwrap().downloaded);
        assert!(store.item("f2").await.unwrap().unwrap().downloaded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bounds_parallelism_and_retries_not_found_once() {
        let remote = Arc::new(FakeRemote::new("drive-1"));
        let mut items = Vec::new();
        for n in 1..=5 {
            let id = format!("f{n}");
            remote.add_content(&id, format!("payload-{n}").as_bytes());
            items.push(file(&id, &format!("file-{n}.bin"), "/"));
        }
        remote.fail_content_once("f3");
        let (_db, store) = seeded_store(items).await;

        let dest = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            max_parallelism: 2,
            batch_size: 2,
        };
        let engine = downloader(Arc::clone(&remote), store.clone());
        engine
            .download_all("drive-1", dest.path(), &options, &CancelToken::new())
            .await
            .unwrap();

        // The transient NotFound was absorbed by the retry.
        assert_eq!(engine.metrics().errors(), 0);
        assert_eq!(engine.metrics().files(), 5);
        for n in 1..=5 {
            let record = store.item(&format!("f{n}")).await.unwrap().unwrap();
            assert!(record.downloaded, "f{n} must be flagged downloaded");
        }
        assert!(
            remote.peak_in_flight() <= 2,
            "observed {} concurrent fetches",
            remote.peak_in_flight()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_failed_file_is_recorded_and_the_run_continues() {
        let remote = Arc::new(FakeRemote::new("drive-1"));
        remote.add_content("f1", b"one");
        remote.add_content("f3", b"three");
        remote.fail_content_always("f2");
        let (_db, store) = seeded_store(vec![
            file("f1", "a.txt", "/"),
            file("f2", "b.txt", "/"),
            file("f3", "c.txt", "/"),
        ])
        .await;

        let dest = tempfile::tempdir().unwrap();
        let engine = downloader(Arc::clone(&remote), store.clone());
        engine
            .download_all(
                "drive-1",
                dest.path(),
                &DownloadOptions::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(engine.metrics().errors(), 1);
        assert_eq!(engine.metrics().files(), 2);
        assert!(!store.item("f2").await.unwrap().unwrap().downloaded);
        assert!(!dest.path().join("b.txt").exists());
        assert!(dest.path().join("c.txt").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_mirror_bootstraps_from_remote_listing() {
        let remote = Arc::new(FakeRemote::new("drive-1"));
        remote.add_children(
            "root",
            vec![folder("d1", "docs", "/"), file("f1", "note.txt", "/")],
        );
        remote.add_children("d1", vec![file("f2", "deep.txt", "/docs")]);
        remote.add_content("f1", b"note");
        remote.add_content("f2", b"deep");

        let db = Database::open_in_memory().await.unwrap();
        let store = MirrorStore::new(db.connection().clone());

        let dest = tempfile::tempdir().unwrap();
        downloader(Arc::clone(&remote), store.clone())
            .download_all(
                "drive-1",
                dest.path(),
                &DownloadOptions::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(store.root().await.unwrap().is_some());
        assert_eq!(store.file_count().await.unwrap(), 2);
        assert_eq!(
            tokio::fs::read(dest.path().join("docs").join("deep.txt"))
                .await
                .unwrap(),
            b"deep"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attached_reporter_emits_progress_and_final_summary() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&emitted);
        let sink = move |message: &str, percent: Option<f64>| {
            sink_log.lock().unwrap().push((message.to_string(), percent));
        };

        let remote = Arc::new(FakeRemote::new("drive-1"));
        remote.add_content("f1", b"one");
        remote.add_content("f2", b"two");
        let (_db, store) =
            seeded_store(vec![file("f1", "a.txt", "/"), file("f2", "b.txt", "/")]).await;

        let dest = tempfile::tempdir().unwrap();
        let reporter =
            ProgressReporter::new(Box::new(sink), 1, Duration::from_secs(3600));
        downloader(Arc::clone(&remote), store.clone())
            .with_reporter(reporter)
            .download_all(
                "drive-1",
                dest.path(),
                &DownloadOptions::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let lines = emitted.lock().unwrap();
        // Per-file reporting fired from the tasks, then the run flushed.
        assert!(lines.len() >= 2);
        let (message, percent) = lines.last().unwrap().clone();
        assert!(message.starts_with("done:"), "got: {message}");
        assert!((percent.unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pre_cancelled_token_downloads_nothing() {
        let remote = Arc::new(FakeRemote::new("drive-1"));
        remote.add_content("f1", b"one");
        let (_db, store) = seeded_store(vec![file("f1", "a.txt", "/")]).await;

        let dest = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = downloader(Arc::clone(&remote), store.clone())
            .download_all("drive-1", dest.path(), &DownloadOptions::default(), &cancel)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!store.item("f1").await.unwrap().unwrap().downloaded);
        assert!(!dest.path().join("a.txt").exists());
    }
}
