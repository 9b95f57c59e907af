/*!
 * Discovery of acquisition items in the primary source directory
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::classify::{Classification, Classifier, RecognizedFile};
use super::identifier::{sanitize, IdentifierExtractor, SessionKey, SortKey};
use super::metadata::Metadata;
use crate::error::{IngestError, Result};

/// One recognized scan: an ordered set of source files sharing a series
#[derive(Debug, Clone)]
pub struct AcquisitionItem {
    pub session: SessionKey,
    pub acquisition_tag: String,
    pub logical_type: String,
    pub series_id: String,
    pub sort_key: Option<SortKey>,
    pub description: Option<String>,
    /// Key auxiliary files are correlated against
    pub correlation_key: Option<String>,
    /// Header fields of the first file in the series
    pub metadata: Metadata,
    pub source_paths: Vec<PathBuf>,
}

impl AcquisitionItem {
    /// Remote scan id: the header series number, else the correlation key
    pub fn series_number(&self) -> Option<String> {
        self.metadata
            .get("SeriesNumber")
            .or(self.correlation_key.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(sanitize)
    }
}

/// Result of scanning the primary source directory
#[derive(Debug, Default)]
pub struct Discovery {
    pub items: Vec<AcquisitionItem>,
    pub unrecognized: Vec<PathBuf>,
    /// Files that could not be keyed (`UnresolvedIdentifier`)
    pub unresolved: Vec<IngestError>,
}

/// List regular, non-hidden files below `dir` in a stable order
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(IngestError::Config(format!(
            "source directory {} does not exist",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
    {
        let entry = entry.map_err(|e| IngestError::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// Scan `source_dir`, classify every file and group recognized files into
/// acquisition items keyed by session and series
pub fn discover_acquisitions(
    source_dir: &Path,
    classifier: &dyn Classifier,
    extractor: &IdentifierExtractor,
) -> Result<Discovery> {
    let files = list_files(source_dir)?;
    debug!(count = files.len(), dir = %source_dir.display(), "classifying source files");

    let classified: Vec<(PathBuf, Classification)> = files
        .into_par_iter()
        .map(|path| {
            let classification = classifier.classify(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "classification failed");
                Classification::Unrecognized
            });
            (path, classification)
        })
        .collect();

    let mut discovery = Discovery::default();
    let mut series: BTreeMap<(SessionKey, String), Vec<(PathBuf, RecognizedFile)>> =
        BTreeMap::new();

    for (path, classification) in classified {
        match classification {
            Classification::Unrecognized => discovery.unrecognized.push(path),
            Classification::Recognized(file) => {
                match extractor.session_key(&path, &file.metadata) {
                    Ok(key) => series
                        .entry((key, file.series_id.clone()))
                        .or_default()
                        .push((path, file)),
                    Err(e) => {
                        warn!(error = %e, "skipping file without session identity");
                        discovery.unresolved.push(e);
                    }
                }
            }
        }
    }

    for ((session, series_id), mut files) in series {
        files.sort_by(|(pa, fa), (pb, fb)| {
            instance_number(&fa.metadata)
                .cmp(&instance_number(&fb.metadata))
                .then_with(|| pa.cmp(pb))
        });
        let (first_path, first) = &files[0];

        let correlation_key = match extractor.correlation_key(first_path, &first.metadata) {
            Some(Ok(key)) => Some(key),
            Some(Err(e)) => {
                warn!(series = %series_id, error = %e, "series has no correlation key");
                None
            }
            None => None,
        };

        let sort_key = extractor.sort_key(&first.metadata);
        let description = first.metadata.get("SeriesDescription").map(str::to_string);
        let acquisition_tag = first.acquisition_tag.clone();
        let logical_type = first.logical_type.clone();
        let metadata = first.metadata.clone();

        discovery.items.push(AcquisitionItem {
            session,
            acquisition_tag,
            logical_type,
            series_id,
            sort_key,
            description,
            correlation_key,
            metadata,
            source_paths: files.into_iter().map(|(p, _)| p).collect(),
        });
    }

    debug!(
        items = discovery.items.len(),
        unrecognized = discovery.unrecognized.len(),
        unresolved = discovery.unresolved.len(),
        "discovery complete"
    );
    Ok(discovery)
}

fn instance_number(metadata: &Metadata) -> Option<u64> {
    metadata.get("InstanceNumber")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classify::{StaticClassifier, DICOM_SERIES_TYPE};
    use crate::core::identifier::Template;
    use tempfile::tempdir;

    fn extractor() -> IdentifierExtractor {
        IdentifierExtractor::new(
            Template::parse("{PatientID}").unwrap(),
            Template::parse("{AccessionNumber}").unwrap(),
        )
        .with_sort_keys(vec![Template::parse("{SeriesDate}").unwrap()])
        .with_correlation(Template::parse("{SeriesNumber}").unwrap())
    }

    fn recognized(tag: &str, series: &str, instance: &str, patient: Option<&str>) -> RecognizedFile {
        let mut metadata = Metadata::new()
            .with("AccessionNumber", "100")
            .with("SeriesNumber", "602")
            .with("InstanceNumber", instance);
        if let Some(p) = patient {
            metadata.insert("PatientID", p);
        }
        RecognizedFile {
            acquisition_tag: tag.to_string(),
            logical_type: DICOM_SERIES_TYPE.to_string(),
            series_id: series.to_string(),
            metadata,
        }
    }

    #[test]
    fn test_groups_series_in_instance_order() {
        let dir = tempdir().unwrap();
        let mut classifier = StaticClassifier::new();
        for (name, instance) in [("b.dcm", "1"), ("a.dcm", "10"), ("c.dcm", "2")] {
            let path = dir.path().join(name);
            std::fs::write(&path, name).unwrap();
            classifier.insert(path, recognized("PET", "1.2.3", instance, Some("subject0")));
        }
        std::fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let discovery = discover_acquisitions(dir.path(), &classifier, &extractor()).unwrap();
        assert_eq!(discovery.items.len(), 1);
        assert_eq!(discovery.unrecognized.len(), 1);

        let item = &discovery.items[0];
        let names: Vec<_> = item
            .source_paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b.dcm", "c.dcm", "a.dcm"]);
        assert_eq!(item.correlation_key.as_deref(), Some("602"));
        assert_eq!(item.series_number().as_deref(), Some("602"));
        assert_eq!(item.session, SessionKey::new("subject0", "100"));
    }

    #[test]
    fn test_unresolved_files_are_reported_not_defaulted() {
        let dir = tempdir().unwrap();
        let mut classifier = StaticClassifier::new();
        let path = dir.path().join("anon.dcm");
        std::fs::write(&path, b"x").unwrap();
        classifier.insert(path, recognized("CT", "9.9", "1", None));

        let discovery = discover_acquisitions(dir.path(), &classifier, &extractor()).unwrap();
        assert!(discovery.items.is_empty());
        assert_eq!(discovery.unresolved.len(), 1);
        assert!(matches!(
            discovery.unresolved[0],
            IngestError::UnresolvedIdentifier { .. }
        ));
    }

    #[test]
    fn test_missing_source_dir_is_config_error() {
        let dir = tempdir().unwrap();
        let err = list_files(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }
}
