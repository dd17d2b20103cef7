//! Error types for the peerbench core library.

/// Top-level error enum for the peerbench core library.
#[derive(Debug, thiserror::Error)]
pub enum PeerbenchError {
    /// Malformed KPI-tree or scope configuration. Fatal at startup: the
    /// registry refuses to load, so no query is ever served against a bad
    /// mapping.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted tables or the line-item store were unreachable or
    /// inconsistent. Soft at query time: the capability detector downgrades
    /// and the next query retries.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A build pipeline stage failed. Fatal to that run only; nothing is
    /// published and the previous generation keeps serving.
    #[error("Build failed at stage '{stage}': {message}")]
    Build {
        stage: &'static str,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type PeerbenchResult<T> = Result<T, PeerbenchError>;
