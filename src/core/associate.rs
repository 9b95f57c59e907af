/*!
 * Correlation of raw auxiliary files with acquisition items
 *
 * Auxiliary files are located with a glob (optionally templated per
 * session) and parsed with a regular expression carrying two named groups:
 * `id`, the correlation key shared with an acquisition item, and
 * `resource`, the sub-kind of raw data. The expression runs once per file;
 * claims are resolved through an id index so cost grows with the number of
 * auxiliary files, not with items times files.
 */

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use super::discovery::AcquisitionItem;
use super::identifier::{SessionKey, SortKey, Template};
use crate::error::{IngestError, Result};

/// A source of auxiliary files: logical type, glob template and pattern
#[derive(Debug, Clone)]
pub struct AssociatedFiles {
    pub logical_type: String,
    pub glob: Template,
    pub pattern: Regex,
}

impl AssociatedFiles {
    /// Validate and compile an associated-files definition. The pattern
    /// must declare both the `id` and `resource` named groups.
    pub fn new(logical_type: &str, glob: &str, pattern: &str) -> Result<Self> {
        let anchored = Regex::new(&format!("^(?:{})", pattern))?;
        let names: BTreeSet<&str> = anchored.capture_names().flatten().collect();
        for required in ["id", "resource"] {
            if !names.contains(required) {
                return Err(IngestError::Config(format!(
                    "associated files pattern '{}' is missing the '{}' named group",
                    pattern, required
                )));
            }
        }
        Ok(Self {
            logical_type: logical_type.to_string(),
            glob: Template::parse(glob)?,
            pattern: anchored,
        })
    }
}

/// A raw file recognized only by its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryFile {
    pub path: PathBuf,
    pub correlation_id: String,
    pub resource_tag: String,
    pub logical_type: String,
    pub sort_key: Option<SortKey>,
}

/// Why an auxiliary file was left unclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnclaimedReason {
    /// The file name does not match the associated-files pattern
    PatternMismatch,
    /// No acquisition item in scope carries the file's id
    NoMatchingItem,
}

impl fmt::Display for UnclaimedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnclaimedReason::PatternMismatch => write!(f, "pattern-mismatch"),
            UnclaimedReason::NoMatchingItem => write!(f, "no-matching-item"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnclaimedFile {
    pub path: PathBuf,
    pub reason: UnclaimedReason,
}

impl UnclaimedFile {
    pub fn to_error(&self) -> IngestError {
        IngestError::UnclaimedAuxiliaryFile {
            path: self.path.clone(),
            reason: self.reason.to_string(),
        }
    }
}

/// Outcome of correlating the auxiliary pool with all items of a run
#[derive(Debug, Default)]
pub struct Association {
    /// Per item (same order as the input items): resource tag → files
    pub claims: Vec<BTreeMap<String, Vec<AuxiliaryFile>>>,
    pub unclaimed: Vec<UnclaimedFile>,
    /// Files whose id matched several items; resolved by tie-break
    pub ambiguous: Vec<PathBuf>,
    pub pool_size: usize,
}

impl Association {
    pub fn claimed_count(&self) -> usize {
        self.claims
            .iter()
            .flat_map(|c| c.values())
            .map(Vec::len)
            .sum()
    }
}

/// Candidate file with the definition that located it and the sessions in scope
struct PoolEntry {
    spec: usize,
    /// `None` when the glob was not session specific
    sessions: Option<BTreeSet<SessionKey>>,
}

/// Locate every auxiliary file for the sessions of `items`
fn collect_pool(
    items: &[AcquisitionItem],
    specs: &[AssociatedFiles],
) -> Result<BTreeMap<PathBuf, PoolEntry>> {
    let mut sessions: BTreeMap<&SessionKey, &AcquisitionItem> = BTreeMap::new();
    for item in items {
        sessions.entry(&item.session).or_insert(item);
    }

    let mut pool: BTreeMap<PathBuf, PoolEntry> = BTreeMap::new();
    for (spec_index, spec) in specs.iter().enumerate() {
        if !spec.glob.has_placeholders() {
            for path in expand_glob(spec.glob.as_str())? {
                pool.entry(path).or_insert(PoolEntry {
                    spec: spec_index,
                    sessions: None,
                });
            }
            continue;
        }

        for (key, item) in &sessions {
            let pattern = match spec.glob.render_with(&item.metadata, |v| glob::Pattern::escape(v)) {
                Ok(pattern) => pattern,
                Err(unresolved) => {
                    warn!(
                        session = %key,
                        placeholder = %unresolved.0,
                        glob = %spec.glob,
                        "cannot render associated files glob for session"
                    );
                    continue;
                }
            };
            for path in expand_glob(&pattern)? {
                let entry = pool.entry(path).or_insert(PoolEntry {
                    spec: spec_index,
                    sessions: Some(BTreeSet::new()),
                });
                if entry.spec == spec_index {
                    if let Some(scope) = entry.sessions.as_mut() {
                        scope.insert((*key).clone());
                    }
                }
            }
        }
    }
    Ok(pool)
}

fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "unreadable path while expanding glob"),
        }
    }
    Ok(paths)
}

/// Parse a pool file against its spec's pattern
fn parse_auxiliary(path: PathBuf, spec: &AssociatedFiles) -> std::result::Result<AuxiliaryFile, PathBuf> {
    let text = path.to_string_lossy().into_owned();
    let Some(caps) = spec.pattern.captures(&text) else {
        return Err(path);
    };
    let (Some(id), Some(resource)) = (caps.name("id"), caps.name("resource")) else {
        return Err(path);
    };
    let correlation_id = id.as_str().to_string();
    let resource_tag = resource.as_str().to_string();
    let sort_key = caps.name("sort").map(|m| SortKey(m.as_str().to_string()));
    Ok(AuxiliaryFile {
        correlation_id,
        resource_tag,
        logical_type: spec.logical_type.clone(),
        sort_key,
        path,
    })
}

/// Correlate auxiliary files with items. Each auxiliary file is claimed by
/// at most one item; everything else ends up in `unclaimed`.
pub fn associate(items: &[AcquisitionItem], specs: &[AssociatedFiles]) -> Result<Association> {
    let mut association = Association {
        claims: vec![BTreeMap::new(); items.len()],
        ..Default::default()
    };
    if specs.is_empty() {
        return Ok(association);
    }

    let pool = collect_pool(items, specs)?;
    association.pool_size = pool.len();

    let mut by_key: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        if let Some(key) = item.correlation_key.as_deref() {
            by_key.entry(key).or_default().push(index);
        }
    }

    for (path, entry) in pool {
        let aux = match parse_auxiliary(path, &specs[entry.spec]) {
            Ok(aux) => aux,
            Err(path) => {
                debug!(path = %path.display(), "auxiliary file does not match pattern");
                association.unclaimed.push(UnclaimedFile {
                    path,
                    reason: UnclaimedReason::PatternMismatch,
                });
                continue;
            }
        };

        let candidates: Vec<usize> = by_key
            .get(aux.correlation_id.as_str())
            .map(|indices| {
                indices
                    .iter()
                    .copied()
                    .filter(|&i| match &entry.sessions {
                        Some(scope) => scope.contains(&items[i].session),
                        None => true,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let winner = match candidates.as_slice() {
            [] => {
                association.unclaimed.push(UnclaimedFile {
                    path: aux.path,
                    reason: UnclaimedReason::NoMatchingItem,
                });
                continue;
            }
            [only] => *only,
            many => {
                let chosen = break_tie(items, many, aux.sort_key.as_ref());
                warn!(
                    path = %aux.path.display(),
                    id = %aux.correlation_id,
                    candidates = many.len(),
                    chosen = %items[chosen].series_id,
                    "auxiliary file matches several items"
                );
                association.ambiguous.push(aux.path.clone());
                chosen
            }
        };

        association.claims[winner]
            .entry(aux.resource_tag.clone())
            .or_default()
            .push(aux);
    }

    for claims in &mut association.claims {
        for files in claims.values_mut() {
            files.sort_by(|a, b| a.path.cmp(&b.path));
        }
    }

    debug!(
        pool = association.pool_size,
        claimed = association.claimed_count(),
        unclaimed = association.unclaimed.len(),
        ambiguous = association.ambiguous.len(),
        "association complete"
    );
    Ok(association)
}

/// Pick the item nearest to the file by sort key; without comparable keys
/// fall back to the smallest (session, sort key, series id)
fn break_tie(items: &[AcquisitionItem], candidates: &[usize], sort_key: Option<&SortKey>) -> usize {
    let ordered = |&a: &usize, &b: &usize| {
        let (ia, ib) = (&items[a], &items[b]);
        ia.session
            .cmp(&ib.session)
            .then_with(|| super::identifier::compare_sort_keys(&ia.sort_key, &ib.sort_key))
            .then_with(|| ia.series_id.cmp(&ib.series_id))
    };

    let nearest = sort_key.and_then(|key| {
        candidates
            .iter()
            .filter_map(|&i| {
                let distance = items[i].sort_key.as_ref()?.distance(key)?;
                Some((distance, i))
            })
            .min_by(|(da, a), (db, b)| da.cmp(db).then_with(|| ordered(a, b)))
            .map(|(_, i)| i)
    });

    nearest.unwrap_or_else(|| {
        candidates
            .iter()
            .copied()
            .min_by(|a, b| ordered(a, b))
            .unwrap_or(candidates[0])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classify::DICOM_SERIES_TYPE;
    use crate::core::metadata::Metadata;
    use std::path::Path;
    use tempfile::tempdir;

    const PATTERN: &str = r".*/[^\.]+\.[^\.]+\.[^\.]+\.(?P<id>\d+)\.[A-Z]+_(?P<resource>[^\.]+).*";

    fn item(subject: &str, key: &str, sort: &str, family: &str) -> AcquisitionItem {
        AcquisitionItem {
            session: SessionKey::new(subject, "1"),
            acquisition_tag: "PET".to_string(),
            logical_type: DICOM_SERIES_TYPE.to_string(),
            series_id: format!("{subject}.{key}"),
            sort_key: Some(SortKey(sort.to_string())),
            description: None,
            correlation_key: Some(key.to_string()),
            metadata: Metadata::new().with("PatientName", format!("{family}^First")),
            source_paths: vec![],
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, name).unwrap();
        path
    }

    #[test]
    fn test_pattern_requires_both_groups() {
        assert!(AssociatedFiles::new("raw", "*.ptd", r"(?P<id>\d+)").is_err());
        assert!(AssociatedFiles::new("raw", "*.ptd", r"(?P<id>\d+)_(?P<resource>\w+)").is_ok());
        assert!(matches!(
            AssociatedFiles::new("raw", "*.ptd", r"(?P<id>"),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn test_partition_law() {
        let dir = tempdir().unwrap();
        let glob = format!("{}/*.ptd", dir.path().display());
        let spec = AssociatedFiles::new("raw", &glob, PATTERN).unwrap();

        touch(dir.path(), "LastA.PT.PET.602.PTD_LISTMODE.ptd");
        touch(dir.path(), "LastA.PT.PET.602.PTD_COUNTRATE.ptd");
        touch(dir.path(), "LastA.PT.PET.999.PTD_LISTMODE.ptd");
        touch(dir.path(), "garbage.ptd");

        let items = vec![item("s0", "602", "20230825", "LastA")];
        let association = associate(&items, &[spec]).unwrap();

        assert_eq!(association.pool_size, 4);
        assert_eq!(association.claimed_count(), 2);
        assert_eq!(association.unclaimed.len(), 2);
        assert_eq!(
            association.claimed_count() + association.unclaimed.len(),
            association.pool_size
        );
        let resources: Vec<_> = association.claims[0].keys().cloned().collect();
        assert_eq!(resources, vec!["COUNTRATE", "LISTMODE"]);

        let reasons: BTreeSet<_> = association
            .unclaimed
            .iter()
            .map(|u| u.reason.to_string())
            .collect();
        assert!(reasons.contains("pattern-mismatch"));
        assert!(reasons.contains("no-matching-item"));
    }

    #[test]
    fn test_session_scoped_glob() {
        let dir = tempdir().unwrap();
        let glob = format!(
            "{}/{{PatientName.family_name}}_*.ptd",
            glob::Pattern::escape(&dir.path().display().to_string())
        );
        let pattern = r".*/(?P<family>[A-Za-z]+)_(?P<id>\d+)_(?P<resource>[A-Z]+)\.ptd";
        let spec = AssociatedFiles::new("raw", &glob, pattern).unwrap();

        touch(dir.path(), "LastA_602_LISTMODE.ptd");
        touch(dir.path(), "LastB_602_LISTMODE.ptd");

        // Both items share id 602 but each glob only reaches its own patient
        let items = vec![
            item("s0", "602", "20230825", "LastA"),
            item("s1", "602", "20230825", "LastB"),
        ];
        let association = associate(&items, &[spec]).unwrap();

        assert!(association.ambiguous.is_empty());
        assert_eq!(association.claims[0]["LISTMODE"].len(), 1);
        assert_eq!(association.claims[1]["LISTMODE"].len(), 1);
        assert!(association.claims[0]["LISTMODE"][0]
            .path
            .ends_with("LastA_602_LISTMODE.ptd"));
    }

    #[test]
    fn test_ambiguous_claim_prefers_nearest_sort_key() {
        let dir = tempdir().unwrap();
        let glob = format!("{}/*.ptd", dir.path().display());
        let pattern = r".*/(?P<id>\d+)_(?P<resource>[A-Z]+)_(?P<sort>\d+)\.ptd";
        let spec = AssociatedFiles::new("raw", &glob, pattern).unwrap();

        touch(dir.path(), "602_LISTMODE_20230901.ptd");

        let items = vec![
            item("s0", "602", "20230825", "A"),
            item("s1", "602", "20230902", "B"),
        ];
        let association = associate(&items, &[spec]).unwrap();

        assert_eq!(association.ambiguous.len(), 1);
        assert!(association.claims[0].is_empty());
        assert_eq!(association.claims[1]["LISTMODE"].len(), 1);
        assert_eq!(association.claimed_count(), 1);
    }

    #[test]
    fn test_ambiguous_claim_without_sort_key_is_deterministic() {
        let dir = tempdir().unwrap();
        let glob = format!("{}/*.ptd", dir.path().display());
        let spec = AssociatedFiles::new("raw", &glob, r".*/(?P<id>\d+)_(?P<resource>[A-Z]+)\.ptd").unwrap();
        touch(dir.path(), "602_LISTMODE.ptd");

        let items = vec![
            item("s1", "602", "20230825", "B"),
            item("s0", "602", "20230825", "A"),
        ];
        let association = associate(&items, &[spec]).unwrap();
        assert_eq!(association.claims[1]["LISTMODE"].len(), 1);
        assert!(association.claims[0].is_empty());
    }
}
