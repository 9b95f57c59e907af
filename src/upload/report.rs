/*!
 * Per-run record of upload outcomes
 */

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use super::bundle::TransferCandidate;
use crate::error::{EXIT_PARTIAL, EXIT_SUCCESS};

/// Terminal outcome of one transfer unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Confirmed,
    Skipped,
    Failed,
    /// Never started because the run was cancelled
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
    pub bundle: String,
    pub label: String,
    pub scan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub outcome: UnitOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitRecord {
    pub fn new(bundle: &str, candidate: &TransferCandidate, outcome: UnitOutcome) -> Self {
        Self {
            bundle: bundle.to_string(),
            label: candidate.label.clone(),
            scan_id: candidate.scan_id.clone(),
            column: None,
            outcome,
            attempts: 0,
            error: None,
        }
    }

    pub fn failed(mut self, attempts: u32, error: impl Into<String>) -> Self {
        self.outcome = UnitOutcome::Failed;
        self.attempts = attempts;
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadCounts {
    pub confirmed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Everything that happened during one upload run
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadManifest {
    pub records: Vec<UnitRecord>,
    /// Directories under the staging root without a usable manifest
    pub skipped_dirs: Vec<PathBuf>,
    /// Bundles removed after a complete upload
    pub removed_bundles: Vec<String>,
    pub aborted: bool,
    pub authentications: u32,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl UploadManifest {
    pub fn counts(&self) -> UploadCounts {
        let mut counts = UploadCounts::default();
        for record in &self.records {
            match record.outcome {
                UnitOutcome::Confirmed => counts.confirmed += 1,
                UnitOutcome::Skipped => counts.skipped += 1,
                UnitOutcome::Failed => counts.failed += 1,
                UnitOutcome::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome == UnitOutcome::Failed)
    }

    /// Non-zero on abort, or on any failure when partial failure counts
    pub fn exit_code(&self, partial_failure_is_error: bool) -> i32 {
        let counts = self.counts();
        if counts.failed == 0 && counts.cancelled == 0 && !self.aborted {
            EXIT_SUCCESS
        } else if self.aborted || partial_failure_is_error {
            EXIT_PARTIAL
        } else {
            EXIT_SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: UnitOutcome) -> UnitRecord {
        UnitRecord {
            bundle: "s_1".to_string(),
            label: "PET".to_string(),
            scan_id: "6".to_string(),
            column: None,
            outcome,
            attempts: 1,
            error: None,
        }
    }

    #[test]
    fn test_counts_and_exit_codes() {
        let mut manifest = UploadManifest {
            records: vec![record(UnitOutcome::Confirmed), record(UnitOutcome::Skipped)],
            ..Default::default()
        };
        assert_eq!(manifest.exit_code(true), EXIT_SUCCESS);

        manifest.records.push(record(UnitOutcome::Failed));
        let counts = manifest.counts();
        assert_eq!((counts.confirmed, counts.skipped, counts.failed), (1, 1, 1));
        assert_eq!(manifest.exit_code(true), EXIT_PARTIAL);
        assert_eq!(manifest.exit_code(false), EXIT_SUCCESS);

        manifest.aborted = true;
        assert_eq!(manifest.exit_code(false), EXIT_PARTIAL);
        assert_eq!(manifest.failures().count(), 1);
    }

    #[test]
    fn test_json_shape() {
        let manifest = UploadManifest {
            records: vec![record(UnitOutcome::Confirmed).failed(3, "HTTP 503")],
            ..Default::default()
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["records"][0]["outcome"], "failed");
        assert_eq!(json["records"][0]["attempts"], 3);
        assert!(json["records"][0].get("column").is_none());
    }
}
