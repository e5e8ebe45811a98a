//! Remote tree service boundary.
//!
//! The engine needs exactly four call shapes from the remote side:
//! list children, delta query, content download, and item creation.
//! Authentication and the wire client live behind this trait; the
//! engine only ever holds an `Arc<dyn RemoteTree>`.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Container, DeltaPage, RemoteItem};

/// Errors surfaced by the remote collaborator.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The requested item or content does not exist (yet). This is the
    /// one signal the downloader treats as transient: content fetched
    /// right after a listing call may lag behind remote propagation.
    #[error("remote item not found: {0}")]
    NotFound(String),
    /// The service answered with an application-level error.
    #[error("remote API error: {0}")]
    Api(String),
    /// The call never reached the service.
    #[error("remote transport error: {0}")]
    Transport(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// The remote hierarchical file store.
///
/// `delta_page` drives incremental sync: `cursor` is either a saved
/// checkpoint token (resume) or a next-page link from the previous page;
/// `None` starts a full snapshot. Each page reports its items together
/// with either `next_page_link` or `delta_link` (see
/// [`DeltaPage`](crate::models::DeltaPage)).
#[async_trait]
pub trait RemoteTree: Send + Sync {
    /// Resolve a user-supplied container reference to a container,
    /// or `None` when nothing matches.
    async fn resolve_container(&self, container_ref: &str) -> RemoteResult<Option<Container>>;

    /// The root item of a container.
    async fn root_item(&self, container_id: &str) -> RemoteResult<RemoteItem>;

    /// Direct children of an item.
    async fn list_children(&self, item_id: &str) -> RemoteResult<Vec<RemoteItem>>;

    /// One page of changed/added/removed items since `cursor`.
    async fn delta_page(&self, container_id: &str, cursor: Option<&str>)
        -> RemoteResult<DeltaPage>;

    /// Content bytes for a file item.
    async fn download_content(&self, item_id: &str) -> RemoteResult<Vec<u8>>;

    /// Create a folder (no payload) or upload a file (payload) by path.
    ///
    /// Part of the collaborator contract for callers that push content
    /// upstream; the mirror engine itself only reads, so nothing in
    /// this crate invokes it.
    async fn create_item(
        &self,
        parent_path: &str,
        name: &str,
        payload: Option<&[u8]>,
    ) -> RemoteResult<RemoteItem>;
}
