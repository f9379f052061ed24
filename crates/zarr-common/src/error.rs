//! Error types for the zarr connector.

use thiserror::Error;

/// Result type alias using ZarrError.
pub type Result<T> = std::result::Result<T, ZarrError>;

/// Primary error type for store, metadata and scan operations.
///
/// The enum is `Clone` so that one failed fetch can be reported to every
/// caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZarrError {
    // === Startup ===
    #[error("configuration error: {0}")]
    Configuration(String),

    // === Object store ===
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("endpoint unreachable for '{key}' after {attempts} attempts: {last_error}")]
    EndpointUnreachable {
        key: String,
        attempts: u32,
        last_error: String,
    },

    // === Schema resolution ===
    #[error("table or array not found: {0}")]
    TableNotFound(String),

    #[error("malformed metadata at '{path}': {reason}")]
    MalformedMetadata { path: String, reason: String },

    #[error("unsupported shape for '{path}': {reason}")]
    UnsupportedShape { path: String, reason: String },

    #[error("unsupported compressor: {0}")]
    UnsupportedCompressor(String),

    // === Scan ===
    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("index {index} out of bounds for chunk of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("scan cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ZarrError {
    /// Create a MalformedMetadata error.
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedShape error.
    pub fn unsupported_shape(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedShape {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZarrError::TransientNetwork(_))
    }

    /// Whether the error means "object absent" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ZarrError::NotFound(_))
    }

    /// Whether the error is reported while resolving a table's schema.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            ZarrError::TableNotFound(_)
                | ZarrError::MalformedMetadata { .. }
                | ZarrError::UnsupportedShape { .. }
                | ZarrError::UnsupportedCompressor(_)
        )
    }

    /// Stable short name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ZarrError::Configuration(_) => "configuration",
            ZarrError::NotFound(_) => "not_found",
            ZarrError::AccessDenied(_) => "access_denied",
            ZarrError::TransientNetwork(_) => "transient_network",
            ZarrError::EndpointUnreachable { .. } => "endpoint_unreachable",
            ZarrError::TableNotFound(_) => "table_not_found",
            ZarrError::MalformedMetadata { .. } => "malformed_metadata",
            ZarrError::UnsupportedShape { .. } => "unsupported_shape",
            ZarrError::UnsupportedCompressor(_) => "unsupported_compressor",
            ZarrError::Decompression(_) => "decompression",
            ZarrError::OutOfBounds { .. } => "out_of_bounds",
            ZarrError::Cancelled => "cancelled",
            ZarrError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for ZarrError {
    fn from(err: std::io::Error) -> Self {
        ZarrError::Decompression(err.to_string())
    }
}

impl From<serde_json::Error> for ZarrError {
    fn from(err: serde_json::Error) -> Self {
        ZarrError::Internal(format!("JSON error: {}", err))
    }
}
