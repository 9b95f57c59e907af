//! Run summaries as human-readable tables or JSON.

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

use crate::core::stage::StageSummary;
use crate::upload::{UnitOutcome, UploadManifest};

/// Output mode for CLI results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Writes summaries to stdout in the selected mode
#[derive(Debug, Clone)]
pub struct OutputWriter {
    pub mode: OutputMode,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            mode: if json { OutputMode::Json } else { OutputMode::Human },
        }
    }

    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    fn json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: cannot serialize summary: {}", e),
        }
    }

    pub fn stage_summary(&self, summary: &StageSummary) {
        match self.mode {
            OutputMode::Json => self.json(summary),
            OutputMode::Human => {
                println!("{}", stage_table(summary));
                println!("{}", stage_totals(summary));
                for path in &summary.unrecognized {
                    println!("  unrecognized: {}", path.display());
                }
                for unresolved in &summary.unresolved {
                    println!("  unresolved: {}", sanitize_error(unresolved));
                }
                for unclaimed in &summary.unclaimed {
                    println!("  unclaimed ({}): {}", unclaimed.reason, unclaimed.path.display());
                }
                for path in &summary.ambiguous {
                    println!("  ambiguous: {}", path.display());
                }
            }
        }
    }

    pub fn upload_summary(&self, manifest: &UploadManifest) {
        match self.mode {
            OutputMode::Json => {
                #[derive(Serialize)]
                struct Report<'a> {
                    counts: crate::upload::UploadCounts,
                    #[serde(flatten)]
                    manifest: &'a UploadManifest,
                }
                self.json(&Report {
                    counts: manifest.counts(),
                    manifest,
                });
            }
            OutputMode::Human => {
                println!("{}", upload_table(manifest));
                let counts = manifest.counts();
                println!(
                    "{}",
                    stats_table(&[
                        ("Uploaded", counts.confirmed.to_string()),
                        ("Skipped", counts.skipped.to_string()),
                        ("Failed", counts.failed.to_string()),
                        ("Cancelled", counts.cancelled.to_string()),
                        ("Duration", format!("{:.1}s", manifest.duration.as_secs_f64())),
                    ])
                );
                for dir in &manifest.skipped_dirs {
                    println!("  skipped directory without manifest: {}", dir.display());
                }
            }
        }
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        match self.mode {
            OutputMode::Json => {
                let value = serde_json::json!({ "success": false, "error": sanitize_error(msg) });
                eprintln!("{}", value);
            }
            OutputMode::Human => eprintln!("Error: {}", sanitize_error(msg)),
        }
    }
}

/// Create a styled data table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Create a key-value table for totals
pub fn stats_table(items: &[(&str, String)]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    for (key, value) in items {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value).add_attribute(Attribute::Bold),
        ]);
    }
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).fg(Color::Cyan).add_attribute(Attribute::Bold))
        .collect()
}

pub fn stage_table(summary: &StageSummary) -> Table {
    let mut table = create_table();
    table.set_header(header(&["Session", "Groups", "Linked", "Copied", "Already", "Deleted", "Status"]));

    for s in &summary.staged {
        let status = if s.dry_run {
            Cell::new("planned").fg(Color::Yellow)
        } else {
            Cell::new("staged").fg(Color::Green)
        };
        table.add_row(vec![
            Cell::new(&s.session),
            Cell::new(s.groups),
            Cell::new(s.files_linked),
            Cell::new(s.files_copied),
            Cell::new(s.files_already_staged),
            Cell::new(s.sources_deleted),
            status,
        ]);
    }
    for f in &summary.failed {
        table.add_row(vec![
            Cell::new(&f.session),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new(format!("{}: {}", f.category, sanitize_error(&f.error))).fg(Color::Red),
        ]);
    }
    for session in &summary.not_started {
        table.add_row(vec![
            Cell::new(session),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("not started").fg(Color::DarkGrey),
        ]);
    }
    table
}

fn stage_totals(summary: &StageSummary) -> Table {
    stats_table(&[
        ("Sessions staged", summary.staged.len().to_string()),
        ("Sessions failed", summary.failed.len().to_string()),
        ("Files placed", summary.files_placed().to_string()),
        ("Unrecognized files", summary.unrecognized.len().to_string()),
        ("Unresolved identifiers", summary.unresolved.len().to_string()),
        ("Unclaimed auxiliary files", summary.unclaimed.len().to_string()),
        ("Ambiguous claims", summary.ambiguous.len().to_string()),
        ("Duration", format!("{:.1}s", summary.duration.as_secs_f64())),
    ])
}

pub fn upload_table(manifest: &UploadManifest) -> Table {
    let mut table = create_table();
    table.set_header(header(&["Bundle", "Unit", "Scan", "Column", "Outcome", "Attempts", "Error"]));
    for r in &manifest.records {
        let outcome = match r.outcome {
            UnitOutcome::Confirmed => Cell::new("uploaded").fg(Color::Green),
            UnitOutcome::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
            UnitOutcome::Failed => Cell::new("failed").fg(Color::Red),
            UnitOutcome::Cancelled => Cell::new("cancelled").fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(&r.bundle),
            Cell::new(&r.label),
            Cell::new(&r.scan_id),
            Cell::new(r.column.as_deref().unwrap_or("-")),
            outcome,
            Cell::new(r.attempts),
            Cell::new(r.error.as_deref().map(sanitize_error).unwrap_or_default()),
        ]);
    }
    table
}

/// Sanitize error messages by collapsing whitespace
pub fn sanitize_error(msg: &str) -> String {
    msg.split_whitespace().collect::<Vec<&str>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::{SessionFailure, SessionOutcome};
    use crate::upload::UnitRecord;
    use std::path::PathBuf;

    #[test]
    fn test_sanitize_error() {
        assert_eq!(sanitize_error("line1\nline2\t  x\r"), "line1 line2 x");
        assert_eq!(sanitize_error("   "), "");
    }

    #[test]
    fn test_stage_table_lists_sessions() {
        let summary = StageSummary {
            staged: vec![SessionOutcome {
                session: "subject0_987654320".to_string(),
                bundle_dir: PathBuf::from("/staging/subject0_987654320"),
                groups: 2,
                files_linked: 10,
                files_copied: 0,
                files_already_staged: 0,
                sources_deleted: 0,
                delete_failures: 0,
                dry_run: false,
            }],
            failed: vec![SessionFailure {
                session: "subject1_1".to_string(),
                category: "staging".to_string(),
                error: "conflict".to_string(),
            }],
            ..Default::default()
        };
        let rendered = stage_table(&summary).to_string();
        assert!(rendered.contains("subject0_987654320"));
        assert!(rendered.contains("subject1_1"));
        assert!(rendered.contains("staging: conflict"));
    }

    #[test]
    fn test_upload_table() {
        let manifest = UploadManifest {
            records: vec![UnitRecord {
                bundle: "s_1".to_string(),
                label: "PET/LISTMODE".to_string(),
                scan_id: "602".to_string(),
                column: Some("listmode".to_string()),
                outcome: UnitOutcome::Confirmed,
                attempts: 1,
                error: None,
            }],
            ..Default::default()
        };
        let rendered = upload_table(&manifest).to_string();
        assert!(rendered.contains("PET/LISTMODE"));
        assert!(rendered.contains("602"));
        assert!(rendered.contains("uploaded"));
    }

    #[test]
    fn test_output_writer_modes() {
        assert!(OutputWriter::new(true).is_json());
        assert_eq!(OutputWriter::new(false).mode, OutputMode::Human);
    }
}
