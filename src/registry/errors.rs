//! Distribution Spec error taxonomy, converted into the top-level
//! [`crate::errors::Error`] and rendered as the registry's JSON error body.

/// One closed-enum error code from the OCI Distribution Specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorCode {
    /// Referenced blob does not exist in this registry.
    BlobUnknown,
    /// Invalid blob upload state (bad chunk offset, unknown session, ...).
    BlobUploadInvalid,
    /// Referenced manifest does not exist.
    ManifestUnknown,
    /// Manifest body failed validation.
    ManifestInvalid,
    /// Caller-supplied digest did not match the computed digest.
    DigestInvalid,
    /// The request asks for behavior this registry does not implement.
    Unsupported,
}

impl ErrorCode {
    /// The Distribution Spec's `SCREAMING_SNAKE_CASE` wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            ErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            ErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            ErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            ErrorCode::DigestInvalid => "DIGEST_INVALID",
            ErrorCode::Unsupported => "UNSUPPORTED",
        }
    }

    /// The HTTP status this code is rendered with.
    pub fn http_status(self) -> http::StatusCode {
        match self {
            ErrorCode::BlobUnknown | ErrorCode::ManifestUnknown => http::StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadInvalid
            | ErrorCode::ManifestInvalid
            | ErrorCode::DigestInvalid => http::StatusCode::BAD_REQUEST,
            ErrorCode::Unsupported => http::StatusCode::NOT_IMPLEMENTED,
        }
    }
}

/// Registry-specific failures, each carrying the Distribution Spec code
/// the HTTP layer renders.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found.
    #[error("blob unknown: {digest}")]
    BlobUnknown {
        /// The digest that was requested.
        digest: String,
    },

    /// Manifest not found.
    #[error("manifest unknown: {repo}:{reference}")]
    ManifestUnknown {
        /// Repository name.
        repo: String,
        /// Tag or digest reference.
        reference: String,
    },

    /// Manifest body or tag name failed validation.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Digest mismatch on upload completion.
    #[error("digest invalid: expected {expected}, computed {computed}")]
    DigestInvalid {
        /// Digest the caller supplied.
        expected: String,
        /// Digest actually computed from the uploaded bytes.
        computed: String,
    },

    /// Upload session does not exist, or a chunk arrived out of order.
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// The request used a feature this registry does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl RegistryError {
    /// The Distribution Spec error code this failure renders as.
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::BlobUnknown { .. } => ErrorCode::BlobUnknown,
            RegistryError::ManifestUnknown { .. } => ErrorCode::ManifestUnknown,
            RegistryError::ManifestInvalid(_) => ErrorCode::ManifestInvalid,
            RegistryError::DigestInvalid { .. } => ErrorCode::DigestInvalid,
            RegistryError::BlobUploadInvalid(_) => ErrorCode::BlobUploadInvalid,
            RegistryError::Unsupported(_) => ErrorCode::Unsupported,
        }
    }
}

/// A single `{code, message, detail}` entry in the Distribution Spec JSON
/// error body.
#[derive(Debug, serde::Serialize)]
pub struct ErrorEntry {
    /// The closed error code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Free-form structured detail; empty object when there's nothing to
    /// add.
    pub detail: serde_json::Value,
}

/// Render `err` as the Distribution Spec's `{"errors": [...]}` body.
pub fn error_body(err: &RegistryError) -> serde_json::Value {
    serde_json::json!({
        "errors": [ErrorEntry {
            code: err.code().as_str(),
            message: err.to_string(),
            detail: serde_json::Value::Null,
        }]
    })
}
