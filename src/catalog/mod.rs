//! Component A: Catalog Store.
//!
//! Persistent data model (services, artifacts, image repos, volumes) with
//! single-writer serialized mutation.

pub mod model;
pub mod store;

pub use model::{ArtifactName, CatalogData, Service, ServiceKind};
pub use store::{CatalogStore, Snapshot};
