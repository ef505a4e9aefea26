use thiserror::Error;

#[derive(Error, Debug)]
pub enum WordPqError {
    // Configuration errors
    #[error("config error: {0}")]
    Config(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Corpus errors (recorded per line, never fatal on their own)
    #[error("parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    // Index errors
    #[error("index error: {0}")]
    Index(String),

    // Storage errors
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("storage path error: {0}")]
    StoragePath(#[from] object_store::path::Error),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WordPqError>;

impl WordPqError {
    /// Errors that abort a build before any persistence write happens.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WordPqError::Config(_) | WordPqError::DimensionMismatch { .. }
        )
    }

    /// Errors raised by the persistence adapter.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            WordPqError::NotFound { .. }
                | WordPqError::Storage(_)
                | WordPqError::StoragePath(_)
                | WordPqError::Serialization(_)
        )
    }

    /// Coarse failure class for logs.
    pub fn stage(&self) -> &'static str {
        if self.is_configuration() {
            "configuration"
        } else if self.is_persistence() {
            "storage"
        } else {
            "indexing"
        }
    }
}
