/*!
 * Staging engine: materializes one bundle per session
 *
 * Layout under the staging root:
 *
 * ```text
 * {root}/{subject}_{session}/MANIFEST.json
 * {root}/{subject}_{session}/{tag}/{index}/{series files}
 * {root}/{subject}_{session}/{tag}/{index}/resources/{resource}/{raw files}
 * ```
 *
 * Sessions are staged in parallel; files inside one session are placed
 * sequentially. Sources are only deleted after every staged file of the
 * session has been verified and the manifest written.
 */

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use super::associate::{associate, AssociatedFiles, Association, AuxiliaryFile, UnclaimedFile};
use super::classify::Classifier;
use super::discovery::{discover_acquisitions, AcquisitionItem};
use super::identifier::{compare_sort_keys, IdentifierExtractor, SessionKey};
use super::manifest::{self, BundleManifest, FileEntry, GroupEntry, ResourceEntry};
use super::placement::{verify_placed, FilePlacer, LinkOrCopyPlacer, PlacementMethod};
use crate::error::{IngestError, Result, EXIT_PARTIAL, EXIT_SUCCESS};

/// Options controlling a staging run
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Remove source files once their staged copies are verified
    pub delete_source: bool,
    /// Stop scheduling sessions after the first failure
    pub fail_fast: bool,
    /// Plan and check for conflicts without writing anything
    pub dry_run: bool,
    /// Worker threads for staging sessions (0 = available parallelism)
    pub workers: usize,
    /// Record SHA-256 digests of staged files in the manifest
    pub checksums: bool,
    pub project: Option<String>,
}

/// One acquisition item and its claimed auxiliary resources
#[derive(Debug, Clone)]
pub struct PlannedGroup {
    pub item: AcquisitionItem,
    pub index: usize,
    pub resources: BTreeMap<String, Vec<AuxiliaryFile>>,
}

/// Everything that goes into one session's bundle
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub key: SessionKey,
    pub groups: Vec<PlannedGroup>,
}

/// A single source → staged destination mapping
#[derive(Debug, Clone)]
struct Placement {
    group: usize,
    resource: Option<String>,
    source: PathBuf,
    relative: PathBuf,
}

impl SessionPlan {
    fn placements(&self) -> Vec<Placement> {
        let mut placements = Vec::new();
        for (group_index, group) in self.groups.iter().enumerate() {
            let tag = &group.item.acquisition_tag;
            let dir = manifest::group_dir(tag, group.index);
            for source in &group.item.source_paths {
                placements.push(Placement {
                    group: group_index,
                    resource: None,
                    relative: dir.join(file_name(source)),
                    source: source.clone(),
                });
            }
            for (resource, files) in &group.resources {
                let dir = manifest::resource_dir(tag, group.index, resource);
                for aux in files {
                    placements.push(Placement {
                        group: group_index,
                        resource: Some(resource.clone()),
                        relative: dir.join(file_name(&aux.path)),
                        source: aux.path.clone(),
                    });
                }
            }
        }
        placements
    }

    /// Reject plans where two sources map onto one staged path
    fn check_conflicts(&self, placements: &[Placement], bundle_dir: &Path) -> Result<()> {
        self.check_directories(bundle_dir)?;

        let mut targets: HashMap<&Path, Vec<&Path>> = HashMap::new();
        for p in placements {
            targets
                .entry(p.relative.as_path())
                .or_default()
                .push(p.source.as_path());
        }
        let mut conflicts: Vec<_> = targets.into_iter().filter(|(_, s)| s.len() > 1).collect();
        conflicts.sort();
        match conflicts.into_iter().next() {
            Some((relative, sources)) => Err(IngestError::StagingConflict {
                session: self.key.to_string(),
                destination: bundle_dir.join(relative),
                sources: sources.into_iter().map(Path::to_path_buf).collect(),
            }),
            None => Ok(()),
        }
    }

    /// Reject plans where distinct tags or resources sanitize to one directory
    fn check_directories(&self, bundle_dir: &Path) -> Result<()> {
        let mut owners: BTreeMap<PathBuf, Vec<Option<&Path>>> = BTreeMap::new();
        for group in &self.groups {
            let tag = &group.item.acquisition_tag;
            owners
                .entry(manifest::group_dir(tag, group.index))
                .or_default()
                .push(group.item.source_paths.first().map(PathBuf::as_path));
            for (resource, files) in &group.resources {
                owners
                    .entry(manifest::resource_dir(tag, group.index, resource))
                    .or_default()
                    .push(files.first().map(|f| f.path.as_path()));
            }
        }

        match owners.into_iter().find(|(_, claims)| claims.len() > 1) {
            Some((dir, claims)) => Err(IngestError::StagingConflict {
                session: self.key.to_string(),
                destination: bundle_dir.join(dir),
                sources: claims.into_iter().flatten().map(Path::to_path_buf).collect(),
            }),
            None => Ok(()),
        }
    }

    fn first_source(&self) -> Option<PathBuf> {
        self.groups
            .iter()
            .find_map(|g| g.item.source_paths.first())
            .cloned()
    }

    pub fn file_count(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.item.source_paths.len() + g.resources.values().map(Vec::len).sum::<usize>())
            .sum()
    }
}

fn file_name(path: &Path) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| path.to_path_buf())
}

/// Group items by session and number each tag's series by sort key
pub fn plan_sessions(items: Vec<AcquisitionItem>, association: Association) -> Vec<SessionPlan> {
    let mut by_session: BTreeMap<SessionKey, Vec<(AcquisitionItem, BTreeMap<String, Vec<AuxiliaryFile>>)>> =
        BTreeMap::new();

    let mut claims = association.claims.into_iter();
    for item in items {
        let resources = claims.next().unwrap_or_default();
        by_session
            .entry(item.session.clone())
            .or_default()
            .push((item, resources));
    }

    by_session
        .into_iter()
        .map(|(key, mut entries)| {
            entries.sort_by(|(a, _), (b, _)| {
                a.acquisition_tag
                    .cmp(&b.acquisition_tag)
                    .then_with(|| compare_sort_keys(&a.sort_key, &b.sort_key))
                    .then_with(|| a.series_id.cmp(&b.series_id))
            });

            let mut counters: HashMap<String, usize> = HashMap::new();
            let groups = entries
                .into_iter()
                .map(|(item, resources)| {
                    let counter = counters.entry(item.acquisition_tag.clone()).or_insert(0);
                    *counter += 1;
                    PlannedGroup {
                        index: *counter,
                        item,
                        resources,
                    }
                })
                .collect();
            SessionPlan { key, groups }
        })
        .collect()
}

/// Result of staging one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: String,
    pub bundle_dir: PathBuf,
    pub groups: usize,
    pub files_linked: usize,
    pub files_copied: usize,
    pub files_already_staged: usize,
    pub sources_deleted: usize,
    pub delete_failures: usize,
    pub dry_run: bool,
}

/// A session that could not be staged
#[derive(Debug, Clone, Serialize)]
pub struct SessionFailure {
    pub session: String,
    pub category: String,
    pub error: String,
}

impl SessionFailure {
    fn new(session: &SessionKey, err: &IngestError) -> Self {
        Self {
            session: session.to_string(),
            category: err.category().to_string(),
            error: err.to_string(),
        }
    }
}

/// Structured report of a staging run
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageSummary {
    pub staged: Vec<SessionOutcome>,
    pub failed: Vec<SessionFailure>,
    /// Sessions never started because the run aborted
    pub not_started: Vec<String>,
    pub unrecognized: Vec<PathBuf>,
    pub unresolved: Vec<String>,
    pub unclaimed: Vec<UnclaimedFile>,
    pub ambiguous: Vec<PathBuf>,
    pub aborted: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl StageSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.aborted
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }

    pub fn files_placed(&self) -> usize {
        self.staged
            .iter()
            .map(|s| s.files_linked + s.files_copied + s.files_already_staged)
            .sum()
    }
}

/// Places planned sessions under a staging root
pub struct Bundler {
    root: PathBuf,
    placer: Arc<dyn FilePlacer>,
    options: StageOptions,
}

impl Bundler {
    pub fn new(root: impl Into<PathBuf>, options: StageOptions) -> Self {
        Self {
            root: root.into(),
            placer: Arc::new(LinkOrCopyPlacer::default()),
            options,
        }
    }

    pub fn with_placer(mut self, placer: Arc<dyn FilePlacer>) -> Self {
        self.placer = placer;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// Stage one session. Any error leaves sources untouched.
    pub fn stage_session(&self, plan: &SessionPlan) -> Result<SessionOutcome> {
        let span = info_span!("stage_session", session = %plan.key);
        let _guard = span.enter();

        let bundle_dir = self.root.join(plan.key.dir_name());
        let placements = plan.placements();
        plan.check_conflicts(&placements, &bundle_dir)?;

        let previous = match BundleManifest::read(&bundle_dir) {
            Ok(previous) if previous.session != plan.key => {
                return Err(IngestError::StagingConflict {
                    session: plan.key.to_string(),
                    destination: BundleManifest::path(&bundle_dir),
                    sources: previous
                        .groups
                        .iter()
                        .find_map(|g| g.files.first())
                        .map(|f| vec![f.source.clone()])
                        .unwrap_or_default(),
                });
            }
            Ok(previous) => Some(previous),
            Err(_) => None,
        };

        let mut outcome = SessionOutcome {
            session: plan.key.to_string(),
            bundle_dir: bundle_dir.clone(),
            groups: plan.groups.len(),
            files_linked: 0,
            files_copied: 0,
            files_already_staged: 0,
            sources_deleted: 0,
            delete_failures: 0,
            dry_run: self.options.dry_run,
        };

        if self.options.dry_run {
            info!(files = placements.len(), bundle = %bundle_dir.display(), "would stage session");
            return Ok(outcome);
        }

        std::fs::create_dir_all(&bundle_dir)?;

        let mut methods = Vec::with_capacity(placements.len());
        for p in &placements {
            let dest = bundle_dir.join(&p.relative);
            let method = self.placer.place(&p.source, &dest).map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    IngestError::StagingConflict {
                        session: plan.key.to_string(),
                        destination: dest.clone(),
                        sources: vec![p.source.clone()],
                    }
                } else {
                    IngestError::Io(e)
                }
            })?;
            match method {
                PlacementMethod::HardLink => outcome.files_linked += 1,
                PlacementMethod::Copy => outcome.files_copied += 1,
                PlacementMethod::AlreadyStaged => outcome.files_already_staged += 1,
            }
            methods.push(method);
        }

        for p in &placements {
            verify_placed(&p.source, &bundle_dir.join(&p.relative))?;
        }

        let mut manifest = self.build_manifest(plan, &placements, &methods, &bundle_dir)?;
        if let Some(previous) = previous {
            manifest.created = previous.created;
        }
        manifest.write(&bundle_dir)?;
        debug!(files = manifest.file_count(), "manifest written");

        if self.options.delete_source {
            for p in &placements {
                match std::fs::remove_file(&p.source) {
                    Ok(()) => outcome.sources_deleted += 1,
                    Err(e) => {
                        warn!(source = %p.source.display(), error = %e, "failed to delete source");
                        outcome.delete_failures += 1;
                    }
                }
            }
        }

        info!(
            linked = outcome.files_linked,
            copied = outcome.files_copied,
            already = outcome.files_already_staged,
            deleted = outcome.sources_deleted,
            "session staged"
        );
        Ok(outcome)
    }

    fn build_manifest(
        &self,
        plan: &SessionPlan,
        placements: &[Placement],
        methods: &[PlacementMethod],
        bundle_dir: &Path,
    ) -> Result<BundleManifest> {
        let mut manifest = BundleManifest::new(plan.key.clone(), self.options.project.clone());

        let mut groups: Vec<GroupEntry> = plan
            .groups
            .iter()
            .map(|g| GroupEntry {
                acquisition_tag: g.item.acquisition_tag.clone(),
                index: g.index,
                series_id: g.item.series_id.clone(),
                scan_id: g.item.series_number(),
                description: g.item.description.clone(),
                logical_type: g.item.logical_type.clone(),
                sort_key: g.item.sort_key.clone(),
                files: Vec::new(),
                resources: g
                    .resources
                    .iter()
                    .map(|(tag, files)| ResourceEntry {
                        resource_tag: tag.clone(),
                        logical_type: files
                            .first()
                            .map(|f| f.logical_type.clone())
                            .unwrap_or_default(),
                        files: Vec::new(),
                    })
                    .collect(),
            })
            .collect();

        for (p, method) in placements.iter().zip(methods) {
            let dest = bundle_dir.join(&p.relative);
            let entry = FileEntry {
                path: p.relative.clone(),
                size: std::fs::metadata(&dest)?.len(),
                sha256: if self.options.checksums {
                    Some(super::checksum::file_digest(&dest)?)
                } else {
                    None
                },
                source: p.source.clone(),
                method: *method,
            };
            let group = &mut groups[p.group];
            match &p.resource {
                None => group.files.push(entry),
                Some(tag) => {
                    if let Some(resource) = group.resources.iter_mut().find(|r| &r.resource_tag == tag) {
                        resource.files.push(entry);
                    }
                }
            }
        }

        manifest.groups = groups;
        Ok(manifest)
    }

    /// Stage every plan on a bounded worker pool. Session failures are
    /// isolated unless `fail_fast` is set, in which case no further session
    /// is started after the first failure.
    pub fn stage_all(&self, plans: &[SessionPlan], summary: &mut StageSummary) -> Result<()> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if self.options.workers > 0 {
            builder = builder.num_threads(self.options.workers);
        }
        let pool = builder
            .build()
            .map_err(|e| IngestError::Config(format!("cannot build staging pool: {}", e)))?;

        let shared = self.shared_bundle_dirs(plans);
        let abort = AtomicBool::new(false);
        let results: Vec<(usize, Option<Result<SessionOutcome>>)> = pool.install(|| {
            plans
                .par_iter()
                .enumerate()
                .map(|(i, plan)| {
                    if abort.load(Ordering::SeqCst) {
                        return (i, None);
                    }
                    let result = match shared.get(&i) {
                        Some((destination, sources)) => Err(IngestError::StagingConflict {
                            session: plan.key.to_string(),
                            destination: destination.clone(),
                            sources: sources.clone(),
                        }),
                        None => self.stage_session(plan),
                    };
                    if let Err(e) = &result {
                        error!(session = %plan.key, error = %e, "session failed");
                        if self.options.fail_fast {
                            abort.store(true, Ordering::SeqCst);
                        }
                    }
                    (i, Some(result))
                })
                .collect()
        });

        for (i, result) in results {
            let plan = &plans[i];
            match result {
                Some(Ok(outcome)) => summary.staged.push(outcome),
                Some(Err(e)) => summary.failed.push(SessionFailure::new(&plan.key, &e)),
                None => summary.not_started.push(plan.key.to_string()),
            }
        }
        summary.aborted = abort.load(Ordering::SeqCst);
        Ok(())
    }

    /// Sessions whose bundle directory name collides with another session's,
    /// mapped to the shared directory and one source per colliding session
    fn shared_bundle_dirs(&self, plans: &[SessionPlan]) -> HashMap<usize, (PathBuf, Vec<PathBuf>)> {
        let mut by_dir: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, plan) in plans.iter().enumerate() {
            by_dir.entry(plan.key.dir_name()).or_default().push(i);
        }

        let mut shared = HashMap::new();
        for (dir, indices) in by_dir.into_iter().filter(|(_, v)| v.len() > 1) {
            warn!(bundle = %dir, sessions = indices.len(), "sessions map to one bundle directory");
            let sources: Vec<PathBuf> = indices.iter().filter_map(|&i| plans[i].first_source()).collect();
            let destination = self.root.join(&dir);
            for i in indices {
                shared.insert(i, (destination.clone(), sources.clone()));
            }
        }
        shared
    }
}

/// Run a full staging pass: discover, associate, plan and place
pub fn run_stage(
    source_dir: &Path,
    classifier: &dyn Classifier,
    extractor: &IdentifierExtractor,
    associated: &[AssociatedFiles],
    bundler: &Bundler,
) -> Result<StageSummary> {
    let start = Instant::now();
    let mut summary = StageSummary::default();

    let discovery = discover_acquisitions(source_dir, classifier, extractor)?;
    summary.unrecognized = discovery.unrecognized;
    summary.unresolved = discovery.unresolved.iter().map(ToString::to_string).collect();

    let association = associate(&discovery.items, associated)?;
    for unclaimed in &association.unclaimed {
        warn!(error = %unclaimed.to_error(), "auxiliary file left unclaimed");
    }
    summary.unclaimed = association.unclaimed.clone();
    summary.ambiguous = association.ambiguous.clone();

    let plans = plan_sessions(discovery.items, association);
    info!(
        sessions = plans.len(),
        files = plans.iter().map(SessionPlan::file_count).sum::<usize>(),
        "staging plan ready"
    );

    if bundler.options().fail_fast && !summary.unresolved.is_empty() {
        error!(count = summary.unresolved.len(), "unresolved identifiers, aborting");
        summary.aborted = true;
        summary.not_started = plans.iter().map(|p| p.key.to_string()).collect();
    } else {
        if !bundler.options().dry_run {
            std::fs::create_dir_all(bundler.root())?;
        }
        bundler.stage_all(&plans, &mut summary)?;
    }

    summary.duration = start.elapsed();
    Ok(summary)
}
