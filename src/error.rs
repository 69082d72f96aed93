//! Error types for mirrorkeep

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// The embedded database could not be opened at all.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    /// Only ever observed through `ReadOutcome::Failed`; public reads report absence.
    #[error("Read failed: {0}")]
    ReadFailure(String),

    #[error("Token acquisition failed (interactive: {interactive}): {message}")]
    TokenAcquisition { interactive: bool, message: String },

    #[error("No valid access token - authorize first")]
    NotAuthorized,

    #[error("Mirror upload failed{}: {message}", status_suffix(.status))]
    UploadFailure { status: Option<u16>, message: String },

    #[error("Remote request failed with status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Malformed multipart body: {0}")]
    Multipart(String),

    #[error("Migration failed: {0}")]
    MigrationFailure(String),

    #[error("Schema version conflict: database is at {found}, this build expects {expected}")]
    VersionConflict { found: i64, expected: i64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl MirrorError {
    /// Whether a later attempt of the same operation may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            MirrorError::UploadFailure { status, .. } => status.map_or(true, |s| s >= 500 || s == 429),
            MirrorError::Remote { status, .. } => *status >= 500 || *status == 429,
            MirrorError::TokenAcquisition { .. } | MirrorError::NotAuthorized => true,
            MirrorError::Http(e) => e.is_timeout() || e.is_connect(),
            MirrorError::WriteFailure(_) | MirrorError::ReadFailure(_) => true,
            MirrorError::StorageUnavailable(_)
            | MirrorError::MigrationFailure(_)
            | MirrorError::VersionConflict { .. }
            | MirrorError::Config(_)
            | MirrorError::Multipart(_)
            | MirrorError::Io(_)
            | MirrorError::Json(_) => false,
        }
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(e: toml::de::Error) -> Self {
        MirrorError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for MirrorError {
    fn from(e: toml::ser::Error) -> Self {
        MirrorError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_failure_display() {
        let with_status = MirrorError::UploadFailure {
            status: Some(403),
            message: "forbidden".into(),
        };
        assert_eq!(
            with_status.to_string(),
            "Mirror upload failed with status 403: forbidden"
        );

        let network = MirrorError::UploadFailure {
            status: None,
            message: "connection reset".into(),
        };
        assert_eq!(network.to_string(), "Mirror upload failed: connection reset");
    }

    #[test]
    fn test_retry_classification() {
        assert!(MirrorError::UploadFailure { status: None, message: String::new() }.is_retryable());
        assert!(MirrorError::UploadFailure { status: Some(503), message: String::new() }.is_retryable());
        assert!(!MirrorError::UploadFailure { status: Some(400), message: String::new() }.is_retryable());
        assert!(!MirrorError::MigrationFailure("half copied".into()).is_retryable());
        assert!(!MirrorError::VersionConflict { found: 2, expected: 1 }.is_retryable());
    }
}
