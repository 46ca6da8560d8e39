//! Chunked-upload protocol helpers: `Range` header parsing, PATCH offset
//! validation, and cross-repo blob mounting. Kept separate from
//! [`crate::registry::storage`] so the wire-level PATCH/PUT semantics don't
//! leak into the storage trait itself.

use crate::errors::{Error, Result};
use crate::registry::errors::RegistryError;
use crate::registry::storage::{Storage, UploadSession};

/// An inclusive byte range, as sent in a chunked-upload `Range` response
/// header (`0-<written-1>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset (always 0 in this registry; uploads are
    /// sequential, never sparse).
    pub start: u64,
    /// Last byte offset, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// The range covering `written` bytes already accepted (empty when 0).
    pub fn for_written(written: u64) -> Self {
        ByteRange {
            start: 0,
            end: written.saturating_sub(1),
        }
    }

    /// Render as the `Range` header value the Distribution Spec expects.
    pub fn to_header(self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

/// Parse a request's `Content-Range` header (`<start>-<end>`) and check it
/// starts exactly where the session left off. Chunks are accepted only in
/// order; this registry never supports sparse/out-of-order upload.
pub fn validate_chunk_offset(content_range: Option<&str>, already_written: u64) -> Result<()> {
    let Some(value) = content_range else {
        // No Content-Range header means "append at the current offset",
        // which is always valid.
        return Ok(());
    };

    let (start_s, end_s) = value
        .split_once('-')
        .ok_or_else(|| RegistryError::BlobUploadInvalid(format!("malformed Content-Range: {value}")))?;
    let start: u64 = start_s
        .trim()
        .parse()
        .map_err(|_| RegistryError::BlobUploadInvalid(format!("malformed Content-Range: {value}")))?;
    let _end: u64 = end_s
        .trim()
        .parse()
        .map_err(|_| RegistryError::BlobUploadInvalid(format!("malformed Content-Range: {value}")))?;

    if start != already_written {
        return Err(RegistryError::BlobUploadInvalid(format!(
            "chunk starts at {start}, expected {already_written}"
        ))
        .into());
    }
    Ok(())
}

/// Result of a successful cross-repo blob mount: the digest is already
/// present, nothing was written.
#[derive(Debug, Clone)]
pub struct MountResult {
    /// The digest that now exists under the requesting repo's namespace.
    pub digest: String,
}

/// Handle `POST .../blobs/uploads/?mount=<digest>&from=<repo>`.
///
/// Blobs are stored in one global content-addressed tree, not scoped per
/// repository, so mounting never copies bytes: it is purely an existence
/// check against the target digest. `from` is accepted for Distribution
/// Spec compatibility but otherwise unused, since there is nothing
/// repo-scoped to look up.
pub async fn mount_blob(storage: &dyn Storage, digest: &str, _from: &str) -> Result<MountResult> {
    if !storage.blob_exists(digest).await? {
        return Err(RegistryError::BlobUnknown {
            digest: digest.to_string(),
        }
        .into());
    }
    Ok(MountResult {
        digest: digest.to_string(),
    })
}

/// Drive one session through a sequence of chunks (used by tests and by
/// the in-memory PUT-with-full-body fast path in the HTTP layer, which
/// skips PATCH entirely).
pub async fn upload_all(
    mut session: Box<dyn UploadSession>,
    chunks: &[&[u8]],
    expected_digest: &str,
) -> Result<String> {
    let (last, rest) = match chunks.split_last() {
        Some(split) => split,
        None => return session.complete(&[], expected_digest).await,
    };
    for chunk in rest {
        session.write_chunk(chunk).await?;
    }
    session.complete(last, expected_digest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fs_storage::FsStorage;

    #[test]
    fn validate_chunk_offset_accepts_contiguous_range() {
        assert!(validate_chunk_offset(Some("0-9"), 0).is_ok());
        assert!(validate_chunk_offset(Some("10-19"), 10).is_ok());
    }

    #[test]
    fn validate_chunk_offset_rejects_gap() {
        let err = validate_chunk_offset(Some("20-29"), 10).unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::BlobUploadInvalid(_))
        ));
    }

    #[test]
    fn validate_chunk_offset_accepts_missing_header() {
        assert!(validate_chunk_offset(None, 42).is_ok());
    }

    #[tokio::test]
    async fn mount_requires_existing_digest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let err = mount_blob(&storage, "sha256:deadbeef", "other/repo")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::BlobUnknown { .. })
        ));

        let digest = storage
            .put_blob(bytes::Bytes::from_static(b"mountable"))
            .await
            .unwrap();
        let mounted = mount_blob(&storage, &digest, "other/repo").await.unwrap();
        assert_eq!(mounted.digest, digest);
    }
}
