//! The wash error taxonomy.

use thiserror::Error;

use crate::action::Action;
use crate::path::EntryPath;

/// Result type for capability operations.
pub type WashResult<T> = Result<T, WashError>;

/// Errors surfaced by the core.
///
/// The variants are the taxonomy the front-ends map onto errno and HTTP
/// status; nothing below this enum leaks to callers. Clone is required so
/// single-flight joiners can each receive the failure.
#[derive(Debug, Clone, Error)]
pub enum WashError {
    /// Path resolution failed at some segment.
    #[error("not found: {0}")]
    NotFound(EntryPath),

    /// The action is not in the entry's supported set.
    #[error("entry {path} does not support {action}")]
    CapabilityUnsupported { path: EntryPath, action: Action },

    /// Plugin stdout did not conform to the calling convention.
    #[error("decode error: {0}")]
    Decode(String),

    /// The plugin subprocess exited non-zero; the message is its stderr.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Deadline exceeded or caller cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Lower-level I/O the caller may retry. Never cached.
    #[error("transient error: {0}")]
    Transient(String),
}

impl WashError {
    /// Decode failure mentioning the field (or `stdout`) that offended.
    pub fn decode(what: impl Into<String>) -> Self {
        WashError::Decode(what.into())
    }

    /// Short category name, recorded in journal entries.
    pub fn category(&self) -> &'static str {
        match self {
            WashError::NotFound(_) => "not-found",
            WashError::CapabilityUnsupported { .. } => "unsupported",
            WashError::Decode(_) => "decode",
            WashError::Plugin(_) => "plugin",
            WashError::Cancelled => "cancelled",
            WashError::Transient(_) => "transient",
        }
    }
}

impl From<std::io::Error> for WashError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::Interrupted => WashError::Cancelled,
            _ => WashError::Transient(err.to_string()),
        }
    }
}
