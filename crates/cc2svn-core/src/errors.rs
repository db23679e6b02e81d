//! Error types for the cc2svn conversion engine.

/// Failure reported by a source-system collaborator (history query or blob
/// retrieval).  Only `Transient` is retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Top-level error enum for the conversion engine.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("source unavailable after {attempts} attempt(s) ({operation}): {message}")]
    SourceUnavailable {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("cache corruption for {key}: {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("unresolvable symlink {link} (branch {branch})")]
    UnresolvableSymlink { link: String, branch: String },

    #[error("orphan branch {branch}: parent {parent} is not available")]
    OrphanBranch { branch: String, parent: String },

    #[error("malformed history event: {0}")]
    MalformedHistoryEvent(String),

    #[error("checkpoint corruption: {0}")]
    CheckpointCorruption(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("conversion cancelled after revision {0}")]
    Cancelled(u64),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvertError {
    /// Whether this error must abort the whole run.  Per-element retrieval
    /// failures and dropped symlinks only affect the element concerned.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConvertError::ElementNotFound(_)
                | ConvertError::AccessDenied(_)
                | ConvertError::UnresolvableSymlink { .. }
                | ConvertError::Source(SourceError::NotFound(_))
                | ConvertError::Source(SourceError::AccessDenied(_))
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ConvertError::Source(SourceError::Transient(_)))
    }

    /// Map a collaborator failure onto the engine taxonomy once retries are
    /// exhausted (or were never applicable).
    pub fn from_source(operation: &str, attempts: u32, err: SourceError) -> Self {
        match err {
            SourceError::NotFound(what) => ConvertError::ElementNotFound(what),
            SourceError::AccessDenied(what) => ConvertError::AccessDenied(what),
            SourceError::Transient(message) => ConvertError::SourceUnavailable {
                operation: operation.to_string(),
                attempts,
                message,
            },
        }
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;
