// Photo Migrator Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Download failed for {name}: {reason}")]
    Download { name: String, reason: String },

    #[error("Corrupted archive {name} (remote id {remote_id}, {size} bytes): {reason}")]
    CorruptedArchive {
        name: String,
        remote_id: String,
        size: u64,
        reason: String,
    },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Metadata merge failed for {path}: {reason}")]
    MetadataMerge { path: String, reason: String },

    #[error("ExifTool error: {0}")]
    ExifTool(String),

    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("Upload failed for {path}: {reason}")]
    Upload { path: String, reason: String },

    #[error("Verification failed for {path}: {reason}")]
    Verification { path: String, reason: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid state transition for {key}: {from} -> {to}")]
    InvalidTransition { key: String, from: String, to: String },

    #[error("Working directory is locked by another run: {0}")]
    Locked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for MigrateError {
    fn from(err: anyhow::Error) -> Self {
        MigrateError::Other(err.to_string())
    }
}

impl MigrateError {
    /// Errors that must abort the whole run rather than a single unit or file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Configuration(_)
                | MigrateError::ConfigParse(_)
                | MigrateError::Authentication(_)
                | MigrateError::Locked(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;
