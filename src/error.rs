/*!
 * Error types for xingest
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum IngestError {
    /// A required naming placeholder could not be resolved for a file
    #[error("Unresolved identifier '{placeholder}' for {}", path.display())]
    UnresolvedIdentifier { path: PathBuf, placeholder: String },

    /// An auxiliary file was not claimed by any acquisition
    #[error("Unclaimed auxiliary file {}: {reason}", path.display())]
    UnclaimedAuxiliaryFile { path: PathBuf, reason: String },

    /// Two staged files would share one destination inside a bundle
    #[error("Staging conflict in session {session}: {} claimed by {}", destination.display(), format_sources(sources))]
    StagingConflict {
        session: String,
        destination: PathBuf,
        sources: Vec<PathBuf>,
    },

    /// A transfer unit failed after exhausting its retry budget
    #[error("Transfer of {unit} failed after {attempts} attempt(s): {message}")]
    TransferFailure {
        unit: String,
        attempts: u32,
        message: String,
    },

    /// Remote authentication failed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Invalid configuration, template or pattern
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was cancelled before this operation started
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::Config(_) | IngestError::Authentication(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is fatal for the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Config(_) | IngestError::Authentication(_) | IngestError::Cancelled
        )
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Io(io_err) => is_io_transient(io_err),
            _ => false,
        }
    }

    /// Get error category for logging and summaries
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::UnresolvedIdentifier { .. } => ErrorCategory::Identifier,
            IngestError::UnclaimedAuxiliaryFile { .. } => ErrorCategory::Association,
            IngestError::StagingConflict { .. } => ErrorCategory::Staging,
            IngestError::TransferFailure { .. } => ErrorCategory::Transfer,
            IngestError::Authentication(_) => ErrorCategory::Security,
            IngestError::Config(_) => ErrorCategory::Configuration,
            IngestError::Cancelled => ErrorCategory::Cancelled,
            IngestError::Io(_) => ErrorCategory::IoError,
            IngestError::Json(_) => ErrorCategory::Manifest,
        }
    }
}

fn is_io_transient(io_err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        io_err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
    )
}

fn format_sources(sources: &[PathBuf]) -> String {
    sources
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<regex::Error> for IngestError {
    fn from(err: regex::Error) -> Self {
        IngestError::Config(format!("invalid regular expression: {}", err))
    }
}

impl From<glob::PatternError> for IngestError {
    fn from(err: glob::PatternError) -> Self {
        IngestError::Config(format!("invalid glob pattern: {}", err))
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(err: toml::de::Error) -> Self {
        IngestError::Config(format!("TOML parse error: {}", err))
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Identifier,
    Association,
    Staging,
    Transfer,
    Security,
    Configuration,
    Cancelled,
    IoError,
    Manifest,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Identifier => write!(f, "identifier"),
            ErrorCategory::Association => write!(f, "association"),
            ErrorCategory::Staging => write!(f, "staging"),
            ErrorCategory::Transfer => write!(f, "transfer"),
            ErrorCategory::Security => write!(f, "security"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Manifest => write!(f, "manifest"),
        }
    }
}
