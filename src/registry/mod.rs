//! Component E: OCI Registry.
//!
//! Distribution-Spec v1.1 HTTP surface (`/v2/...`) backed by
//! content-addressed storage, either plain filesystem ([`fs_storage`]) or
//! delegated to an external content store ([`content_store`]). The HTTP
//! layer ([`http`]) is storage-agnostic: it only ever talks to the
//! [`storage::Storage`] trait.

pub mod content_store;
pub mod errors;
pub mod fs_storage;
pub mod http;
pub mod storage;
pub mod upload;

pub use errors::RegistryError;
pub use http::RegistryHandler;
pub use storage::{Storage, StoredManifest, UploadSession};
