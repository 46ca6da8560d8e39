//! The catalog store: single-writer, multi-reader persistence over
//! `db.json`, atomic on every mutation.
//!
//! `CatalogStore` is cheap to clone (an `Arc` around shared state) and
//! every read hands back an immutable snapshot rather than a lock guard,
//! so callers never hold the writer up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::catalog::model::{CatalogData, Service};
use crate::errors::{Error, Result};

/// An immutable view of the catalog at a point in time.
pub type Snapshot = Arc<CatalogData>;

/// Persistent, serialized-mutation catalog store.
#[derive(Clone)]
pub struct CatalogStore {
    path: PathBuf,
    data: Arc<RwLock<Snapshot>>,
    writer: Arc<Mutex<()>>,
}

impl CatalogStore {
    /// Open (or initialize) the catalog at `path`, the canonical `db.json`
    /// under the configured data directory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = fs::read(&path).await?;
            let parsed: CatalogData =
                serde_json::from_slice(&bytes).map_err(|source| Error::CatalogCorrupt {
                    path: path.clone(),
                    source,
                })?;
            parsed
        } else {
            CatalogData::default()
        };

        Ok(CatalogStore {
            path,
            data: Arc::new(RwLock::new(Arc::new(data))),
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Take an immutable snapshot of the whole catalog.
    pub async fn get(&self) -> Snapshot {
        self.data.read().await.clone()
    }

    /// Replace the whole catalog wholesale (bulk operations). Still goes
    /// through the same atomic-write commit path as every other mutation.
    pub async fn set(&self, new_data: CatalogData) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.commit(new_data).await
    }

    /// Apply `f` to a clone of the current catalog, then atomically commit
    /// the result. Acquires the single writer lock for the duration.
    pub async fn mutate_data<F>(&self, f: F) -> Result<Snapshot>
    where
        F: FnOnce(&mut CatalogData) -> Result<()>,
    {
        let _writer = self.writer.lock().await;
        let current = self.data.read().await.clone();
        let mut next = (*current).clone();
        f(&mut next)?;
        self.commit(next.clone()).await?;
        Ok(Arc::new(next))
    }

    /// Apply `f` to the named service, creating the entry first if absent.
    /// `make_default` is used only on creation.
    pub async fn mutate_service<F>(
        &self,
        name: &str,
        make_default: impl FnOnce() -> Service,
        f: F,
    ) -> Result<Snapshot>
    where
        F: FnOnce(&mut Service) -> Result<()>,
    {
        self.mutate_data(|data| {
            let entry = data
                .services
                .entry(name.to_string())
                .or_insert_with(make_default);
            f(entry)
        })
        .await
    }

    /// Atomic write: serialize, write to a sibling temp file, fsync, then
    /// rename over the canonical path. The rename is the commit point —
    /// on crash the file is either the previous full state or the new one,
    /// never a partial write.
    async fn commit(&self, data: CatalogData) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&data)?;

        let tmp_path = self.tmp_path();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        {
            let mut f = fs::File::create(&tmp_path).await?;
            use tokio::io::AsyncWriteExt;
            f.write_all(&bytes).await?;
            f.sync_all().await?;
        }
        fs::rename(&tmp_path, &self.path).await?;

        let mut guard = self.data.write().await;
        *guard = Arc::new(data);
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db.json".to_string());
        self.path
            .with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Path to the catalog file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::ServiceKind;

    #[tokio::test]
    async fn mutate_service_creates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().join("db.json")).await.unwrap();

        store
            .mutate_service(
                "svc-a",
                || Service::new("svc-a", "root", ServiceKind::Init),
                |svc| {
                    svc.latest_generation = 1;
                    Ok(())
                },
            )
            .await
            .unwrap();

        let snap = store.get().await;
        assert_eq!(snap.services["svc-a"].latest_generation, 1);

        // Re-open from disk and confirm the rename landed.
        let reopened = CatalogStore::open(dir.path().join("db.json")).await.unwrap();
        let snap = reopened.get().await;
        assert_eq!(snap.services["svc-a"].latest_generation, 1);
    }

    #[tokio::test]
    async fn corrupt_catalog_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let err = CatalogStore::open(&path).await.unwrap_err();
        assert!(matches!(err, Error::CatalogCorrupt { .. }));
    }
}
