/*!
 * xingest - clinical imaging ingest
 *
 * Stages loose imaging acquisitions into per-session bundles and uploads
 * them to a remote imaging repository:
 * - Header-driven subject/session naming with templates
 * - Correlation of raw instrument output to the series it belongs to
 * - Hard-link staging with copy fallback and idempotent re-runs
 * - Concurrent, retrying uploads over one shared authenticated session
 */

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod output;
pub mod upload;

// Re-export commonly used types
pub use config::{Config, LoggingConfig, StageConfig, UploadConfig};
pub use crate::core::{run_stage, Bundler, StageOptions, StageSummary};
pub use error::{IngestError, Result};
pub use upload::{UploadManifest, UploadOptions, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
