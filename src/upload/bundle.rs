/*!
 * Reading staged bundles back from the staging root
 */

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::identifier::sanitize;
use crate::core::manifest::{self, BundleManifest, FileEntry, GroupEntry};
use crate::error::{IngestError, Result};

/// One group (primary series or one auxiliary resource) eligible for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCandidate {
    /// `PET` for a series, `PET/LISTMODE` for one of its resources
    pub label: String,
    pub tag: String,
    pub index: usize,
    pub resource: Option<String>,
    pub description: Option<String>,
    pub logical_type: String,
    /// Remote scan id, shared by a series and its resources
    pub scan_id: String,
    /// Directory holding the files, relative to the bundle root
    pub content_dir: PathBuf,
    /// Files relative to `content_dir`
    pub files: Vec<PathBuf>,
}

impl TransferCandidate {
    pub fn new(
        tag: &str,
        index: usize,
        resource: Option<String>,
        description: Option<String>,
        logical_type: &str,
        content_dir: PathBuf,
        files: Vec<PathBuf>,
    ) -> Self {
        let label = match &resource {
            Some(r) => format!("{}/{}", tag, r),
            None => tag.to_string(),
        };
        Self {
            scan_id: format!("{}-{}", sanitize(tag), index),
            label,
            tag: tag.to_string(),
            index,
            resource,
            description,
            logical_type: logical_type.to_string(),
            content_dir,
            files,
        }
    }

    /// `{tag}/{index}` or `{tag}/{index}/{resource}`
    pub fn index_path(&self) -> String {
        match &self.resource {
            Some(r) => format!("{}/{}/{}", self.tag, self.index, r),
            None => format!("{}/{}", self.tag, self.index),
        }
    }
}

/// A staged session directory with its manifest
#[derive(Debug, Clone)]
pub struct StagedBundle {
    pub dir: PathBuf,
    pub name: String,
    pub manifest: BundleManifest,
}

impl StagedBundle {
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest = BundleManifest::read(dir)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| manifest.session.dir_name());
        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            manifest,
        })
    }

    /// Transfer candidates in manifest order. Each series becomes one scan
    /// and its resources are uploaded into that scan.
    pub fn candidates(&self) -> Vec<TransferCandidate> {
        let mut candidates = Vec::new();
        let mut used = HashSet::new();
        for group in &self.manifest.groups {
            let scan_id = unique_scan_id(scan_id_of(group), &mut used);
            let dir = group.relative_dir();
            let first = candidates.len();
            candidates.push(TransferCandidate::new(
                &group.acquisition_tag,
                group.index,
                None,
                group.description.clone(),
                &group.logical_type,
                dir.clone(),
                relative_to(&dir, &group.files),
            ));
            for resource in &group.resources {
                let dir = manifest::resource_dir(&group.acquisition_tag, group.index, &resource.resource_tag);
                candidates.push(TransferCandidate::new(
                    &group.acquisition_tag,
                    group.index,
                    Some(resource.resource_tag.clone()),
                    group.description.clone(),
                    &resource.logical_type,
                    dir.clone(),
                    relative_to(&dir, &resource.files),
                ));
            }
            for candidate in &mut candidates[first..] {
                candidate.scan_id = scan_id.clone();
            }
        }
        candidates
    }

    /// Staged files listed for a candidate that are no longer on disk
    pub fn missing_files(&self, candidate: &TransferCandidate) -> Vec<PathBuf> {
        let base = self.dir.join(&candidate.content_dir);
        candidate
            .files
            .iter()
            .filter(|f| !base.join(f).is_file())
            .cloned()
            .collect()
    }
}

fn scan_id_of(group: &GroupEntry) -> String {
    group
        .scan_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", sanitize(&group.acquisition_tag), group.index))
}

/// `base`, or `base-{n}` with the smallest free `n` from 2
fn unique_scan_id(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn relative_to(dir: &Path, files: &[FileEntry]) -> Vec<PathBuf> {
    files
        .iter()
        .map(|f| {
            f.path
                .strip_prefix(dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| f.path.clone())
        })
        .collect()
}

/// Bundles found under a staging root
#[derive(Debug, Default)]
pub struct BundleScan {
    pub bundles: Vec<StagedBundle>,
    /// Directories without a readable manifest
    pub skipped: Vec<PathBuf>,
}

pub fn scan_bundles(root: &Path) -> Result<BundleScan> {
    if !root.is_dir() {
        return Err(IngestError::Config(format!(
            "staging directory {} does not exist",
            root.display()
        )));
    }

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            !path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    dirs.sort();

    let mut scan = BundleScan::default();
    for dir in dirs {
        if !BundleManifest::path(&dir).is_file() {
            warn!(dir = %dir.display(), "no manifest, skipping directory");
            scan.skipped.push(dir);
            continue;
        }
        match StagedBundle::open(&dir) {
            Ok(bundle) => {
                debug!(bundle = %bundle.name, groups = bundle.manifest.groups.len(), "found bundle");
                scan.bundles.push(bundle);
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable manifest, skipping directory");
                scan.skipped.push(dir);
            }
        }
    }
    Ok(scan)
}
