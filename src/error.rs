//! Error types shared by every layer of the feed cache.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Error, Debug)]
pub enum FeedError {
    /// The local archive path does not exist.
    #[error("feed archive not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The container exists but cannot be parsed as a zip archive.
    #[error("corrupt feed archive {}: {message}", .path.display())]
    CorruptArchive { path: PathBuf, message: String },

    /// A table the caller asked for is not in the archive.
    #[error("table '{0}' missing from feed archive")]
    TableMissing(String),

    /// Neither `calendar` nor `calendar_dates` yielded a service date.
    #[error("feed has no calendar rows to derive a date range from")]
    EmptyCalendar,

    /// Network/transport failure, non-success status or fetch timeout.
    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    /// The downloaded body cannot be used as a cache entry.
    #[error("downloaded content for '{name}' is invalid: {message}")]
    Validation { name: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// The injected graph builder reported a failure.
    #[error("graph build failed: {0}")]
    Build(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    pub fn corrupt(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn download(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Download {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn validation(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Validation {
            name: name.into(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns `true` for failures scoped to a single feed source, which the
    /// cache and policy layers record and move past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FeedError::TableMissing(_)
                | FeedError::EmptyCalendar
                | FeedError::Download { .. }
                | FeedError::Validation { .. }
        )
    }

    /// Short machine-readable label, written into report rows.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::NotFound(_) => "not_found",
            FeedError::CorruptArchive { .. } => "corrupt_archive",
            FeedError::TableMissing(_) => "table_missing",
            FeedError::EmptyCalendar => "empty_calendar",
            FeedError::Download { .. } => "download_error",
            FeedError::Validation { .. } => "validation_error",
            FeedError::Config(_) => "config_error",
            FeedError::Build(_) => "build_error",
            FeedError::Io(_) => "io_error",
            FeedError::Csv(_) => "csv_error",
            FeedError::Json(_) => "json_error",
        }
    }
}
