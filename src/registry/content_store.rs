//! The content-store-backed [`Storage`] variant: forwards blobs to an
//! external content-addressed store and registers manifests in an image
//! service so the local container runtime (containerd or compatible) sees
//! them without a separate `ctr images import` step.
//!
//! Both collaborators are narrow HTTP interfaces — this struct is the
//! adapter, not a reimplementation of containerd's content/images gRPC
//! services. A real deployment would talk to containerd's local gRPC
//! socket; this implementation speaks the same shape of operations over
//! plain HTTP rather than pulling in a separate gRPC stack.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::{Error, Result};
use crate::registry::errors::RegistryError;
use crate::registry::storage::{Storage, StoredManifest, UploadSession};

/// Talks to an external content store (`blob_base`) and image service
/// (`image_base`) over HTTP. Both default to loopback addresses, the way
/// containerd's own content/images services are reached over a local
/// socket in production deployments.
pub struct ContentStoreBacked {
    client: reqwest::Client,
    content_base: String,
    image_base: String,
}

impl ContentStoreBacked {
    /// Bind to the given content-store and image-service base URLs.
    pub fn new(content_base: impl Into<String>, image_base: impl Into<String>) -> Self {
        ContentStoreBacked {
            client: reqwest::Client::new(),
            content_base: content_base.into(),
            image_base: image_base.into(),
        }
    }

    fn blob_url(&self, digest: &str) -> String {
        format!("{}/blobs/{}", self.content_base, digest.replace(':', "/"))
    }

    fn upload_url(&self, id: &uuid::Uuid) -> String {
        format!("{}/uploads/{id}", self.content_base)
    }

    async fn register_image(&self, repo: &str, reference: &str, digest: &str) -> Result<()> {
        let body = serde_json::json!({
            "name": format!("{repo}:{reference}"),
            "target": { "digest": digest },
        });
        let resp = self
            .client
            .put(format!("{}/images/{repo}", self.image_base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("image service unreachable: {e}")))?;
        if !resp.status().is_success() {
            log::warn!(
                "image service rejected registration of {repo}:{reference}: HTTP {}",
                resp.status()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for ContentStoreBacked {
    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.blob_url(digest))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("content store unreachable: {e}")))?;
        Ok(resp.status().is_success())
    }

    async fn read_blob(&self, digest: &str) -> Result<Option<Bytes>> {
        let resp = self
            .client
            .get(self.blob_url(digest))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("content store unreachable: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            resp.bytes()
                .await
                .map_err(|e| Error::Transient(format!("content store read failed: {e}")))?,
        ))
    }

    async fn blob_size(&self, digest: &str) -> Result<Option<u64>> {
        let resp = self
            .client
            .head(self.blob_url(digest))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("content store unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        Ok(resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }

    async fn delete_blob(&self, digest: &str) -> Result<()> {
        let _ = self.client.delete(self.blob_url(digest)).send().await;
        Ok(())
    }

    async fn start_upload(&self) -> Result<Box<dyn UploadSession>> {
        let id = uuid::Uuid::new_v4();
        Ok(Box::new(ContentStoreUploadSession {
            client: self.client.clone(),
            url: self.upload_url(&id),
            id,
            buffer: Vec::new(),
        }))
    }

    async fn get_upload(&self, id: uuid::Uuid) -> Result<Box<dyn UploadSession>> {
        // The content store is the source of truth for in-flight bytes;
        // resuming means picking the buffer back up from its side.
        let url = self.upload_url(&id);
        let existing = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("content store unreachable: {e}")))?
            .bytes()
            .await
            .unwrap_or_default();
        Ok(Box::new(ContentStoreUploadSession {
            client: self.client.clone(),
            url,
            id,
            buffer: existing.to_vec(),
        }))
    }

    async fn put_blob(&self, bytes: Bytes) -> Result<String> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = format!("sha256:{:x}", hasher.finalize());
        let resp = self
            .client
            .put(self.blob_url(&digest))
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("content store unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(RegistryError::Unsupported(format!(
                "content store rejected blob {digest}: HTTP {}",
                resp.status()
            ))
            .into());
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
        let digest = self.put_blob(bytes.clone()).await?;
        self.register_image(repo, reference, &digest).await?;
        if reference != digest {
            self.register_image(repo, &digest, &digest).await?;
        }
        Ok(StoredManifest {
            bytes,
            digest,
            media_type,
        })
    }

    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<Option<StoredManifest>> {
        let resp = self
            .client
            .get(format!("{}/images/{repo}/{reference}", self.image_base))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("image service unreachable: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        #[derive(serde::Deserialize)]
        struct ImageRef {
            target: TargetRef,
        }
        #[derive(serde::Deserialize)]
        struct TargetRef {
            digest: String,
        }
        let parsed: ImageRef = resp
            .json()
            .await
            .map_err(|e| Error::Transient(format!("bad image service response: {e}")))?;
        let bytes = self.read_blob(&parsed.target.digest).await?;
        Ok(bytes.map(|bytes| StoredManifest {
            bytes,
            digest: parsed.target.digest,
            media_type: None,
        }))
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        let _ = self
            .client
            .delete(format!("{}/images/{repo}/{reference}", self.image_base))
            .send()
            .await;
        Ok(())
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/images/{repo}", self.image_base))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("image service unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        #[derive(serde::Deserialize)]
        struct ImageList {
            #[serde(default)]
            tags: Vec<String>,
        }
        let parsed: ImageList = resp
            .json()
            .await
            .map_err(|e| Error::Transient(format!("bad image service response: {e}")))?;
        Ok(parsed.tags)
    }
}

struct ContentStoreUploadSession {
    client: reqwest::Client,
    url: String,
    id: uuid::Uuid,
    buffer: Vec<u8>,
}

#[async_trait]
impl UploadSession for ContentStoreUploadSession {
    fn id(&self) -> uuid::Uuid {
        self.id
    }

    fn written(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        let _ = self
            .client
            .put(&self.url)
            .body(self.buffer.clone())
            .send()
            .await;
        Ok(())
    }

    async fn complete(mut self: Box<Self>, trailing: &[u8], expected_digest: &str) -> Result<String> {
        self.buffer.extend_from_slice(trailing);
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.buffer);
        let computed = format!("sha256:{:x}", hasher.finalize());
        if computed != expected_digest {
            return Err(RegistryError::DigestInvalid {
                expected: expected_digest.to_string(),
                computed,
            }
            .into());
        }
        let dest = format!(
            "{}/blobs/{}",
            self.url.rsplit_once("/uploads/").map(|(b, _)| b).unwrap_or(&self.url),
            computed.replace(':', "/")
        );
        let resp = self
            .client
            .put(&dest)
            .body(self.buffer.clone())
            .send()
            .await
            .map_err(|e| Error::Transient(format!("content store unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(RegistryError::Unsupported(format!(
                "content store rejected blob commit: HTTP {}",
                resp.status()
            ))
            .into());
        }
        let _ = self.client.delete(&self.url).send().await;
        Ok(computed)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        let _ = self.client.delete(&self.url).send().await;
        Ok(())
    }
}
