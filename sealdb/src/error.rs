use thiserror::Error;

#[derive(Error, Debug)]
pub enum SealDbError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error at '{path}': {message}")]
    Validation { path: String, message: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt database file {path}: {reason}")]
    CorruptState { path: String, reason: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The in-memory state changed but the following save failed, so memory and disk have diverged.
    #[error("'{operation}' was applied in memory but not saved: {source}")]
    NotPersisted {
        operation: String,
        #[source]
        source: Box<SealDbError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SealDbError {
    pub(crate) fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        SealDbError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_persisted(operation: &str, source: SealDbError) -> Self {
        SealDbError::NotPersisted {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    /// True when the error was raised after an in-memory change that never reached disk.
    pub fn is_unsaved(&self) -> bool {
        matches!(self, SealDbError::NotPersisted { .. })
    }
}

pub type Result<T> = std::result::Result<T, SealDbError>;
