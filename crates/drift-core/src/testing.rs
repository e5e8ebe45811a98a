//! Shared test double for the remote tree service.
//!
//! Scripted, in-memory, and instrumented: delta pages are served in the
//! order they were pushed, content fetches can be primed to fail, and an
//! in-flight counter records the peak download concurrency observed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{Container, DeltaPage, RemoteItem};
use crate::remote::{RemoteError, RemoteResult, RemoteTree};

enum DeltaStep {
    Page(DeltaPage),
    Fail(String),
}

#[derive(Default)]
struct FakeState {
    delta_steps: VecDeque<DeltaStep>,
    children: HashMap<String, Vec<RemoteItem>>,
    content: HashMap<String, Vec<u8>>,
    not_found_once: HashSet<String>,
    always_fail: HashSet<String>,
}

pub struct FakeRemote {
    container_id: String,
    root: RemoteItem,
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeRemote {
    pub fn new(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            root: RemoteItem {
                id: "root".to_string(),
                name: "root".to_string(),
                is_folder: true,
                last_modified: Utc::now(),
                parent_path: None,
                etag: None,
                deleted: false,
            },
            state: Mutex::new(FakeState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue the next delta page.
    pub fn push_page(&self, page: DeltaPage) {
        self.state
            .lock()
            .unwrap()
            .delta_steps
            .push_back(DeltaStep::Page(page));
    }

    /// Queue a delta-call failure before the next page.
    pub fn fail_next_delta(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .delta_steps
            .push_back(DeltaStep::Fail(message.to_string()));
    }

    /// Register listing children for the bootstrap path.
    pub fn add_children(&self, parent_id: &str, children: Vec<RemoteItem>) {
        self.state
            .lock()
            .unwrap()
            .children
            .insert(parent_id.to_string(), children);
    }

    /// Register downloadable content for an item id.
    pub fn add_content(&self, item_id: &str, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .content
            .insert(item_id.to_string(), bytes.to_vec());
    }

    /// Make the first content fetch for `item_id` report `NotFound`.
    pub fn fail_content_once(&self, item_id: &str) {
        self.state
            .lock()
            .unwrap()
            .not_found_once
            .insert(item_id.to_string());
    }

    /// Make every content fetch for `item_id` fail with an API error.
    pub fn fail_content_always(&self, item_id: &str) {
        self.state
            .lock()
            .unwrap()
            .always_fail
            .insert(item_id.to_string());
    }

    /// Highest number of concurrent `download_content` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTree for FakeRemote {
    async fn resolve_container(&self, container_ref: &str) -> RemoteResult<Option<Container>> {
        if container_ref == self.container_id {
            Ok(Some(Container {
                id: self.container_id.clone(),
                name: Some(self.container_id.clone()),
            }))
        } else {
            Ok(None)
        }
    }

    async fn root_item(&self, _container_id: &str) -> RemoteResult<RemoteItem> {
        Ok(self.root.clone())
    }

    async fn list_children(&self, item_id: &str) -> RemoteResult<Vec<RemoteItem>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .children
            .get(item_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delta_page(
        &self,
        _container_id: &str,
        _cursor: Option<&str>,
    ) -> RemoteResult<DeltaPage> {
        let step = self.state.lock().unwrap().delta_steps.pop_front();
        match step {
            Some(DeltaStep::Page(page)) => Ok(page),
            Some(DeltaStep::Fail(message)) => Err(RemoteError::Transport(message)),
            None => Err(RemoteError::Api("no scripted delta page".to_string())),
        }
    }

    async fn download_content(&self, item_id: &str) -> RemoteResult<Vec<u8>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        // Stay in flight long enough for overlap to be observable.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = {
            let mut state = self.state.lock().unwrap();
            if state.always_fail.contains(item_id) {
                Err(RemoteError::Api(format!("content fetch failed: {item_id}")))
            } else if state.not_found_once.remove(item_id) {
                Err(RemoteError::NotFound(item_id.to_string()))
            } else {
                state
                    .content
                    .get(item_id)
                    .cloned()
                    .ok_or_else(|| RemoteError::NotFound(item_id.to_string()))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn create_item(
        &self,
        parent_path: &str,
        name: &str,
        payload: Option<&[u8]>,
    ) -> RemoteResult<RemoteItem> {
        Ok(RemoteItem {
            id: format!("created-{name}"),
            name: name.to_string(),
            is_folder: payload.is_none(),
            last_modified: Utc::now(),
            parent_path: Some(parent_path.to_string()),
            etag: None,
            deleted: false,
        })
    }
}
