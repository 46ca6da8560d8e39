//! The `Storage` abstraction the registry HTTP layer is built against.
//! Two implementations exist: [`crate::registry::fs_storage::FsStorage`]
//! (plain content-addressed filesystem) and
//! [`crate::registry::content_store::ContentStoreBacked`] (delegates blobs
//! to an external content store and registers images so the local
//! container runtime can see them).

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;

/// A manifest as stored: raw bytes, its computed digest, and the media
/// type it was pushed with (if the caller supplied one).
#[derive(Debug, Clone)]
pub struct StoredManifest {
    /// Raw manifest bytes, exactly as pushed.
    pub bytes: Bytes,
    /// `sha256:<hex>` digest of `bytes`.
    pub digest: String,
    /// `Content-Type` the manifest was pushed with, if any.
    pub media_type: Option<String>,
}

/// One in-progress chunked blob upload.
#[async_trait]
pub trait UploadSession: Send + Sync {
    /// This session's UUID.
    fn id(&self) -> uuid::Uuid;

    /// Bytes accepted so far (the current `Range` upper bound + 1).
    fn written(&self) -> u64;

    /// Append `chunk`, updating the streaming digest. Chunks must arrive
    /// in order; out-of-order writes are rejected by the caller before
    /// reaching here.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Complete the upload: append any trailing bytes, verify the
    /// streaming digest matches `expected_digest`, and commit the blob
    /// into content-addressed storage. Returns the final digest.
    async fn complete(self: Box<Self>, trailing: &[u8], expected_digest: &str) -> Result<String>;

    /// Abandon the upload and clean up its scratch file.
    async fn cancel(self: Box<Self>) -> Result<()>;
}

/// Storage operations the registry HTTP layer needs; implementors own the
/// actual bytes (filesystem, or an external content-addressed store).
#[async_trait]
pub trait Storage: Send + Sync {
    /// True if a blob with this digest is already stored.
    async fn blob_exists(&self, digest: &str) -> Result<bool>;

    /// Read a whole blob into memory. `None` if it doesn't exist.
    ///
    /// Blobs in this system are small artifacts (compose files, env
    /// files, scripts) rather than multi-gigabyte image layers, so
    /// whole-blob reads are the right tradeoff against streaming
    /// complexity.
    async fn read_blob(&self, digest: &str) -> Result<Option<Bytes>>;

    /// Size of a stored blob in bytes, if it exists.
    async fn blob_size(&self, digest: &str) -> Result<Option<u64>>;

    /// Delete a blob by digest. Not an error if it doesn't exist.
    async fn delete_blob(&self, digest: &str) -> Result<()>;

    /// Begin a new chunked upload session.
    async fn start_upload(&self) -> Result<Box<dyn UploadSession>>;

    /// Resume an existing upload session by id.
    async fn get_upload(&self, id: uuid::Uuid) -> Result<Box<dyn UploadSession>>;

    /// Store `bytes` as a complete blob in one shot (used by the
    /// cross-repo mount fallback and small in-memory pushes). Returns the
    /// computed digest.
    async fn put_blob(&self, bytes: Bytes) -> Result<String>;

    /// Store a manifest under both `reference` (a tag or digest) and its
    /// own computed digest, for `repo`.
    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        bytes: Bytes,
        media_type: Option<String>,
    ) -> Result<StoredManifest>;

    /// Fetch a manifest by tag or digest.
    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<Option<StoredManifest>>;

    /// Delete a manifest reference. Not an error if it doesn't exist.
    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()>;

    /// List tag references (excluding bare digests) stored for `repo`, for
    /// the `GET /v2/<repo>/tags/list` endpoint.
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>>;
}
