//! Filesystem-backed [`Storage`]: content-addressed blobs under
//! `blobs/sha256/<ab>/<cd>/<digest>`, manifests under
//! `manifests/<repo>/<reference>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{Error, Result};
use crate::registry::errors::RegistryError;
use crate::registry::storage::{Storage, StoredManifest, UploadSession};

/// Root-relative blob path for `digest` (`sha256:<hex>` or bare `<hex>`).
fn blob_path(root: &Path, digest: &str) -> PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    root.join("blobs")
        .join("sha256")
        .join(&hex[0..2])
        .join(&hex[2..4])
        .join(hex)
}

fn manifest_dir(root: &Path, repo: &str) -> PathBuf {
    root.join("manifests").join(repo)
}

fn sha256_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Plain filesystem content-addressed registry storage.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Bind storage to `root` (the configured `registry/` directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStorage { root: root.into() }
    }

    async fn uploads_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("uploads");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(blob_path(&self.root, digest))
            .await
            .unwrap_or(false))
    }

    async fn read_blob(&self, digest: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(blob_path(&self.root, digest)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn blob_size(&self, digest: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(blob_path(&self.root, digest)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_blob(&self, digest: &str) -> Result<()> {
        let path = blob_path(&self.root, digest);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_upload(&self) -> Result<Box<dyn UploadSession>> {
        let dir = self.uploads_dir().await?;
        let id = uuid::Uuid::new_v4();
        let path = dir.join(id.to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok(Box::new(FsUploadSession {
            root: self.root.clone(),
            id,
            path,
            file: Arc::new(Mutex::new(file)),
            hasher: Sha256::new(),
            written: 0,
        }))
    }

    async fn get_upload(&self, id: uuid::Uuid) -> Result<Box<dyn UploadSession>> {
        let path = self.uploads_dir().await?.join(id.to_string());
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(RegistryError::BlobUploadInvalid(format!(
                "unknown upload session {id}"
            ))
            .into());
        }
        let existing = tokio::fs::read(&path).await?;
        let written = existing.len() as u64;
        let mut hasher = Sha256::new();
        hasher.update(&existing);
        let file = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
        Ok(Box::new(FsUploadSession {
            root: self.root.clone(),
            id,
            path,
            file: Arc::new(Mutex::new(file)),
            hasher,
            written,
        }))
    }

    async fn put_blob(&self, bytes: Bytes) -> Result<String> {
        let digest = sha256_digest(&bytes);
        let path = blob_path(&self.root, &digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, &bytes).await?;
        }
        Ok(digest)
    }

    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        bytes: Bytes,
        media_type: Option<String>,
    ) -> Result<StoredManifest> {
        let digest = sha256_digest(&bytes);
        let dir = manifest_dir(&self.root, repo);
        tokio::fs::create_dir_all(&dir).await?;

        tokio::fs::write(dir.join(&digest.replace(':', "_")), &bytes).await?;
        tokio::fs::write(dir.join(reference.replace(':', "_")), &bytes).await?;
        if let Some(mt) = &media_type {
            tokio::fs::write(dir.join(format!("{}.media-type", reference.replace(':', "_"))), mt)
                .await?;
        }

        Ok(StoredManifest {
            bytes,
            digest,
            media_type,
        })
    }

    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<Option<StoredManifest>> {
        let dir = manifest_dir(&self.root, repo);
        let path = dir.join(reference.replace(':', "_"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => Bytes::from(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let digest = sha256_digest(&bytes);
        let media_type = tokio::fs::read_to_string(
            dir.join(format!("{}.media-type", reference.replace(':', "_"))),
        )
        .await
        .ok();
        Ok(Some(StoredManifest {
            bytes,
            digest,
            media_type,
        }))
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        let dir = manifest_dir(&self.root, repo);
        let path = dir.join(reference.replace(':', "_"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let dir = manifest_dir(&self.root, repo);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tags = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("sha256_") || name.ends_with(".media-type") {
                continue;
            }
            tags.push(name);
        }
        tags.sort();
        Ok(tags)
    }
}

struct FsUploadSession {
    root: PathBuf,
    id: uuid::Uuid,
    path: PathBuf,
    file: Arc<Mutex<tokio::fs::File>>,
    hasher: Sha256,
    written: u64,
}

#[async_trait]
impl UploadSession for FsUploadSession {
    fn id(&self) -> uuid::Uuid {
        self.id
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(chunk).await?;
        file.flush().await?;
        drop(file);
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn complete(mut self: Box<Self>, trailing: &[u8], expected_digest: &str) -> Result<String> {
        if !trailing.is_empty() {
            let mut file = self.file.lock().await;
            file.write_all(trailing).await?;
            file.flush().await?;
            drop(file);
            self.hasher.update(trailing);
            self.written += trailing.len() as u64;
        }

        let computed = format!("sha256:{:x}", self.hasher.clone().finalize());
        if computed != expected_digest {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(RegistryError::DigestInvalid {
                expected: expected_digest.to_string(),
                computed,
            }
            .into());
        }

        let dest = blob_path(&self.root, &computed);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            // Idempotent: another concurrent upload already committed the
            // same digest. Discard this scratch copy rather than erroring.
            let _ = tokio::fs::remove_file(&self.path).await;
        } else {
            tokio::fs::rename(&self.path, &dest)
                .await
                .map_err(Error::Io)?;
        }
        Ok(computed)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        let _ = tokio::fs::remove_file(&self.path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let mut upload = storage.start_upload().await.unwrap();
        upload.write_chunk(b"hello ").await.unwrap();
        let digest = sha256_digest(b"hello world");
        let digest = upload.complete(b"world", &digest).await.unwrap();

        assert!(storage.blob_exists(&digest).await.unwrap());
        let bytes = storage.read_blob(&digest).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn digest_mismatch_is_rejected_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let mut upload = storage.start_upload().await.unwrap();
        upload.write_chunk(b"data").await.unwrap();
        let err = upload
            .complete(b"", "sha256:0000000000000000000000000000000000000000000000000000000000000000")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::DigestInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_completion_of_same_digest_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let bytes = Bytes::from_static(b"shared content");
        let digest_a = storage.put_blob(bytes.clone()).await.unwrap();
        let digest_b = storage.put_blob(bytes).await.unwrap();
        assert_eq!(digest_a, digest_b);
        assert!(storage.blob_exists(&digest_a).await.unwrap());
    }

    #[tokio::test]
    async fn manifest_put_then_get_by_tag_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let stored = storage
            .put_manifest("svc-a/app", "latest", body.clone(), Some("application/vnd.oci.image.manifest.v1+json".into()))
            .await
            .unwrap();

        let by_tag = storage.get_manifest("svc-a/app", "latest").await.unwrap().unwrap();
        assert_eq!(by_tag.bytes, body);
        let by_digest = storage
            .get_manifest("svc-a/app", &stored.digest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_digest.digest, stored.digest);
    }
}
