/*!
 * Upload orchestration
 *
 * Bundles are uploaded concurrently up to `concurrency`; the units of one
 * bundle go one after another against the shared [`SessionHandle`].
 * Cancelling the run (Ctrl-C or fail-fast) stops new units from starting
 * while units already in flight run to a terminal state.
 */

pub mod bundle;
pub mod client;
pub mod columns;
pub mod package;
pub mod report;
pub mod retry;
pub mod session;
pub mod transfer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::UploadConfig;
use crate::core::identifier::sanitize;
use crate::error::{IngestError, Result};

pub use bundle::{scan_bundles, StagedBundle, TransferCandidate};
pub use client::{RemoteError, RemoteRepository, SessionToken, UploadTarget, XnatClient};
pub use columns::{ColumnDefinition, ColumnSet, Selection};
pub use report::{UnitOutcome, UnitRecord, UploadCounts, UploadManifest};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::SessionHandle;
pub use transfer::{TransferSettings, TransferState, TransferUnit};

/// Run-level upload policy
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Overrides the project recorded in bundle manifests
    pub project: Option<String>,
    pub fail_fast: bool,
    pub concurrency: usize,
    /// Resource label for primary series files
    pub primary_resource: String,
    pub remove_after_upload: bool,
    pub transfer: TransferSettings,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            project: None,
            fail_fast: false,
            concurrency: 2,
            primary_resource: "DICOM".to_string(),
            remove_after_upload: false,
            transfer: TransferSettings::default(),
        }
    }
}

impl UploadOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            project: config.project.clone(),
            fail_fast: config.fail_fast,
            concurrency: config.concurrency.max(1),
            primary_resource: config.primary_resource.clone(),
            remove_after_upload: config.remove_after_upload,
            transfer: TransferSettings {
                retry: config.retry.clone(),
                wait_period: config.wait_period(),
                confirm_polls: config.confirm_polls,
                confirm_interval: config.confirm_interval(),
                packaging: config.packaging,
                temp_dir: config.temp_dir.clone(),
            },
        }
    }
}

struct RunContext {
    remote: Arc<dyn RemoteRepository>,
    session: SessionHandle,
    columns: Arc<ColumnSet>,
    options: UploadOptions,
    cancel: CancellationToken,
}

/// Uploads every staged bundle under a staging root
pub struct Uploader {
    remote: Arc<dyn RemoteRepository>,
    columns: Arc<ColumnSet>,
    options: UploadOptions,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(remote: Arc<dyn RemoteRepository>, columns: ColumnSet, options: UploadOptions) -> Self {
        Self {
            remote,
            columns: Arc::new(columns),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run from starting further units
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, staging_root: &Path) -> Result<UploadManifest> {
        let start = Instant::now();
        let scan = scan_bundles(staging_root)?;
        info!(
            bundles = scan.bundles.len(),
            skipped = scan.skipped.len(),
            columns = self.columns.len(),
            "starting upload"
        );

        let ctx = Arc::new(RunContext {
            remote: Arc::clone(&self.remote),
            session: SessionHandle::new(Arc::clone(&self.remote)),
            columns: Arc::clone(&self.columns),
            options: self.options.clone(),
            cancel: self.cancel.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));

        let mut tasks = JoinSet::new();
        for (index, bundle) in scan.bundles.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = ctx.cancel.cancelled() => None,
                };
                let outcome = match permit {
                    Some(_permit) => {
                        let span = info_span!("bundle", bundle = %bundle.name);
                        upload_bundle(&ctx, &bundle).instrument(span).await
                    }
                    None => BundleOutcome {
                        records: cancel_all(&bundle),
                        removed: false,
                    },
                };
                (index, bundle.name, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| IngestError::Io(std::io::Error::other(e)))?;
            results.push(result);
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut manifest = UploadManifest {
            skipped_dirs: scan.skipped,
            ..Default::default()
        };
        for (_, name, outcome) in results {
            manifest.records.extend(outcome.records);
            if outcome.removed {
                manifest.removed_bundles.push(name);
            }
        }
        manifest.aborted = self.cancel.is_cancelled();
        manifest.authentications = ctx.session.authentications();
        manifest.duration = start.elapsed();

        let counts = manifest.counts();
        info!(
            confirmed = counts.confirmed,
            skipped = counts.skipped,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "upload finished"
        );
        Ok(manifest)
    }
}

struct BundleOutcome {
    records: Vec<UnitRecord>,
    removed: bool,
}

fn cancel_all(bundle: &StagedBundle) -> Vec<UnitRecord> {
    bundle
        .candidates()
        .iter()
        .map(|c| UnitRecord::new(&bundle.name, c, UnitOutcome::Cancelled))
        .collect()
}

async fn upload_bundle(ctx: &RunContext, bundle: &StagedBundle) -> BundleOutcome {
    let project = ctx
        .options
        .project
        .clone()
        .or_else(|| bundle.manifest.project.clone());

    let mut records = Vec::new();
    let mut scan_types = HashMap::new();
    for candidate in bundle.candidates() {
        let record = upload_candidate(ctx, bundle, &candidate, project.as_deref(), &mut scan_types).await;
        if record.outcome == UnitOutcome::Failed && ctx.options.fail_fast && !ctx.cancel.is_cancelled() {
            error!(unit = %candidate.label, "unit failed, aborting run");
            ctx.cancel.cancel();
        }
        records.push(record);
    }

    let complete = records
        .iter()
        .all(|r| matches!(r.outcome, UnitOutcome::Confirmed | UnitOutcome::Skipped));
    let mut removed = false;
    if ctx.options.remove_after_upload && complete {
        match tokio::fs::remove_dir_all(&bundle.dir).await {
            Ok(()) => {
                info!(dir = %bundle.dir.display(), "bundle removed after upload");
                removed = true;
            }
            Err(e) => warn!(dir = %bundle.dir.display(), error = %e, "failed to remove bundle"),
        }
    }
    BundleOutcome { records, removed }
}

async fn upload_candidate(
    ctx: &RunContext,
    bundle: &StagedBundle,
    candidate: &TransferCandidate,
    project: Option<&str>,
    scan_types: &mut HashMap<String, String>,
) -> UnitRecord {
    let mut record = UnitRecord::new(&bundle.name, candidate, UnitOutcome::Cancelled);
    if ctx.cancel.is_cancelled() {
        return record;
    }

    let column = match ctx.columns.select(candidate) {
        Selection::Skip => {
            debug!(unit = %candidate.label, "no matching column, skipping");
            record.outcome = UnitOutcome::Skipped;
            return record;
        }
        Selection::Column(column) => Some(column),
        Selection::AlwaysInclude => None,
    };
    record.column = column.map(|c| c.name.clone());

    // Resources go into their series' scan and keep the type it was created with
    let scan_type = match &candidate.resource {
        None => {
            let scan_type = column
                .map(|c| c.name.clone())
                .unwrap_or_else(|| candidate.tag.clone());
            scan_types.insert(candidate.scan_id.clone(), scan_type.clone());
            scan_type
        }
        Some(_) => scan_types
            .get(&candidate.scan_id)
            .cloned()
            .unwrap_or_else(|| candidate.tag.clone()),
    };

    let Some(project) = project else {
        return record.failed(0, "no project configured for bundle");
    };

    let missing = bundle.missing_files(candidate);
    if let Some(first) = missing.first() {
        return record.failed(
            0,
            format!(
                "missing staged file {} ({} missing)",
                bundle.dir.join(&candidate.content_dir).join(first).display(),
                missing.len()
            ),
        );
    }

    let target = UploadTarget {
        project: project.to_string(),
        subject: sanitize(&bundle.manifest.session.subject),
        session: bundle.name.clone(),
        scan_id: candidate.scan_id.clone(),
        scan_type,
        resource: candidate
            .resource
            .clone()
            .unwrap_or_else(|| ctx.options.primary_resource.clone()),
        format: column
            .map(|c| c.logical_type.clone())
            .unwrap_or_else(|| candidate.logical_type.clone()),
        file_count: candidate.files.len(),
    };
    let unit = TransferUnit {
        label: format!("{}:{}", bundle.name, candidate.label),
        target,
        base_dir: bundle.dir.join(&candidate.content_dir),
        files: candidate.files.clone(),
    };

    let result = transfer::transfer(ctx.remote.as_ref(), &ctx.session, &ctx.options.transfer, unit).await;
    record.attempts = result.attempts;
    match result.state {
        TransferState::Confirmed => record.outcome = UnitOutcome::Confirmed,
        _ => {
            record.outcome = UnitOutcome::Failed;
            record.error = result.error.map(|e| e.to_string());
        }
    }
    record
}
