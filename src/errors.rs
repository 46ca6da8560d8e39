//! Error taxonomy for the core: catalog, installer, registry and RPC each
//! contribute a variant set that converts into this top-level enum via
//! `#[from]`.

use std::path::PathBuf;

/// Top-level error type returned by every fallible operation in `catch_core`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named service does not exist in the catalog.
    #[error("service not found: {name}")]
    ServiceNotFound {
        /// Service name that was looked up.
        name: String,
    },

    /// An artifact name is not one of the closed set the catalog recognizes.
    #[error("unknown artifact kind: {kind}")]
    UnknownArtifactKind {
        /// The offending kind string.
        kind: String,
    },

    /// A ref name collided with a reserved ref (`staged`, `latest`, `gen-<N>`).
    #[error("ref '{ref_name}' is reserved and cannot be set directly")]
    ReservedRef {
        /// The reserved ref name.
        ref_name: String,
    },

    /// Generation requested does not exist, or is older than the retention
    /// window.
    #[error("generation {requested} is too old")]
    GenerationTooOld {
        /// Requested generation.
        requested: u64,
    },

    /// A service-kind transition was attempted that is not allowed (e.g.
    /// Compose -> Init).
    #[error("service '{name}' is kind {from:?}, cannot transition to {to:?}")]
    KindDowngrade {
        /// Service name.
        name: String,
        /// Current kind.
        from: crate::catalog::model::ServiceKind,
        /// Requested kind.
        to: crate::catalog::model::ServiceKind,
    },

    /// State conflict: an operation requires a precondition on the catalog
    /// that does not hold (staged/committed conflict, volume exists, etc).
    #[error("state conflict: {0}")]
    Conflict(String),

    /// Caller-supplied input was invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Caller is not authorized to perform the requested operation.
    #[error("unauthorized")]
    Unauthorized,

    /// The catalog's on-disk file failed to parse; this is always fatal,
    /// corrupt file on load is always fatal, never silently ignored.
    #[error("catalog at {path} is corrupt: {source}")]
    CatalogCorrupt {
        /// Path to the catalog file.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A registry-specific failure; carries the Distribution Spec error
    /// code so the HTTP layer can render the right body.
    #[error(transparent)]
    Registry(#[from] crate::registry::errors::RegistryError),

    /// An installer-specific failure.
    #[error(transparent)]
    Installer(#[from] crate::installer::errors::InstallerError),

    /// A runner (init/compose façade) failure.
    #[error("runner failure: {0}")]
    Runner(String),

    /// Transient failure (network, subprocess hiccup) surfaced to the
    /// caller as a warning where possible rather than aborting the whole
    /// operation.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Generic I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure outside the catalog-corruption path.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failure, used for compose file rewriting.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Internal invariant violation. Should never surface to a client;
    /// logged at `error` and mapped to JSON-RPC `-32603`/HTTP 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if this error represents a "not found" condition, used by the
    /// RPC and registry layers to pick the right wire-level status code.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ServiceNotFound { .. }
                | Error::Registry(crate::registry::errors::RegistryError::BlobUnknown { .. })
                | Error::Registry(crate::registry::errors::RegistryError::ManifestUnknown { .. })
        )
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
