//! Installer-specific error variants, converted into the top-level
//! [`crate::errors::Error`] via `#[from]`.

/// Errors raised by the File Installer (component C) and Generation
/// Installer (component D).
#[derive(Debug, thiserror::Error)]
pub enum InstallerError {
    /// The upload was explicitly failed by the caller via `Fail()`.
    #[error("upload failed: {0}")]
    Failed(String),

    /// The detected payload kind is not one of the supported kinds.
    #[error("unsupported payload kind: {0}")]
    UnsupportedKind(String),

    /// `pull` was requested for a kind that does not permit image pulls.
    #[error("pull is not permitted for detected kind {kind}")]
    PullNotPermitted {
        /// The detected kind.
        kind: String,
    },

    /// The service's existing kind is incompatible with the newly detected
    /// kind, and no upgrade exemption applies.
    #[error("service kind {existing:?} is incompatible with newly detected kind requiring {required:?}")]
    KindMismatch {
        /// Existing service kind.
        existing: crate::catalog::model::ServiceKind,
        /// Kind the new payload requires.
        required: crate::catalog::model::ServiceKind,
    },

    /// No usable `/24` host remained in the `svc` network allocation pool.
    #[error("svc network address pool exhausted")]
    NetworkPoolExhausted,

    /// No default-route interface could be resolved for macvlan.
    #[error("no default-route interface found for macvlan")]
    NoDefaultRouteInterface,

    /// Generic installer I/O failure with file context.
    #[error("installer I/O error on {path}: {source}")]
    Io {
        /// Path the failing operation touched.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
