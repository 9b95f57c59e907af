/*!
 * Integration tests for staging runs over real directory trees
 */

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use xingest::core::associate::{AssociatedFiles, UnclaimedReason};
use xingest::core::classify::{RecognizedFile, StaticClassifier, DICOM_SERIES_TYPE};
use xingest::core::identifier::{IdentifierExtractor, Template};
use xingest::core::manifest::{BundleManifest, MANIFEST_FILE};
use xingest::core::metadata::Metadata;
use xingest::core::placement::{FilePlacer, LinkOrCopyPlacer, PlacementMethod};
use xingest::core::{run_stage, Bundler, StageOptions};
use xingest::error::{EXIT_PARTIAL, EXIT_SUCCESS};

struct Fixture {
    root: TempDir,
    classifier: StaticClassifier,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("source")).unwrap();
        fs::create_dir_all(root.path().join("raw")).unwrap();
        Self {
            root,
            classifier: StaticClassifier::new(),
        }
    }

    fn source(&self) -> PathBuf {
        self.root.path().join("source")
    }

    fn raw(&self) -> PathBuf {
        self.root.path().join("raw")
    }

    fn staging(&self) -> PathBuf {
        self.root.path().join("staging")
    }

    /// Write `count` files of one series and register them with the classifier
    fn series(&mut self, subject: &str, session: &str, tag: &str, number: u32, count: usize) -> Vec<PathBuf> {
        let dir = self.source();
        let series_id = format!("1.2.840.{}.{}.{}", subject, session, number);
        let mut paths = Vec::new();
        for i in 1..=count {
            let path = dir.join(format!("{}_{}_{}_{}_{:03}.dcm", subject, session, tag, number, i));
            fs::write(&path, format!("{} {} instance {}", series_id, tag, i)).unwrap();
            let metadata = Metadata::new()
                .with("PatientID", subject)
                .with("AccessionNumber", session)
                .with("SeriesNumber", number.to_string())
                .with("SeriesDate", format!("2024010{}", number % 10))
                .with("InstanceNumber", i.to_string());
            self.classifier.insert(
                &path,
                RecognizedFile {
                    acquisition_tag: tag.to_string(),
                    logical_type: DICOM_SERIES_TYPE.to_string(),
                    series_id: series_id.clone(),
                    metadata,
                },
            );
            paths.push(path);
        }
        paths
    }

    fn raw_file(&self, name: &str) -> PathBuf {
        let path = self.raw().join(name);
        fs::write(&path, format!("raw payload {}", name)).unwrap();
        path
    }

    fn raw_spec(&self) -> AssociatedFiles {
        AssociatedFiles::new(
            "application/x-siemens-raw",
            &format!("{}/*.ptd", self.raw().display()),
            r".*/(?P<id>\d+)_(?P<resource>[A-Z]+)\.ptd",
        )
        .unwrap()
    }
}

fn extractor() -> IdentifierExtractor {
    IdentifierExtractor::new(
        Template::parse("{PatientID}").unwrap(),
        Template::parse("{AccessionNumber}").unwrap(),
    )
    .with_sort_keys(vec![Template::parse("{SeriesDate}").unwrap()])
    .with_correlation(Template::parse("{SeriesNumber}").unwrap())
}

/// Delegates to the default placer but fails once `fail_at` files were placed
struct FailingPlacer {
    placed: AtomicUsize,
    fail_at: usize,
}

impl FilePlacer for FailingPlacer {
    fn place(&self, source: &Path, dest: &Path) -> io::Result<PlacementMethod> {
        if self.placed.fetch_add(1, Ordering::SeqCst) >= self.fail_at {
            return Err(io::Error::other("injected placement failure"));
        }
        LinkOrCopyPlacer::default().place(source, dest)
    }
}

#[test]
fn test_stage_builds_layout_and_manifest() {
    let mut fx = Fixture::new();
    fx.series("subject0", "987654320", "PET", 1, 3);
    fx.series("subject0", "987654320", "CT", 2, 2);
    fx.raw_file("1_LISTMODE.ptd");

    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            project: Some("PROJ".to_string()),
            checksums: true,
            ..Default::default()
        },
    );
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[fx.raw_spec()], &bundler).unwrap();

    assert_eq!(summary.exit_code(), EXIT_SUCCESS);
    assert_eq!(summary.staged.len(), 1);
    assert!(summary.unclaimed.is_empty());

    let bundle = fx.staging().join("subject0_987654320");
    assert!(bundle.join(MANIFEST_FILE).is_file());
    assert!(bundle.join("PET/1/subject0_987654320_PET_1_001.dcm").is_file());
    assert!(bundle.join("CT/1/subject0_987654320_CT_2_002.dcm").is_file());
    assert!(bundle.join("PET/1/resources/LISTMODE/1_LISTMODE.ptd").is_file());

    let manifest = BundleManifest::read(&bundle).unwrap();
    assert_eq!(manifest.project.as_deref(), Some("PROJ"));
    let scan_ids: Vec<_> = manifest
        .groups
        .iter()
        .map(|g| (g.acquisition_tag.as_str(), g.scan_id.as_deref()))
        .collect();
    assert_eq!(scan_ids, vec![("CT", Some("2")), ("PET", Some("1"))]);
    assert_eq!(manifest.file_count(), 6);
    assert!(manifest
        .groups
        .iter()
        .flat_map(|g| &g.files)
        .all(|f| f.sha256.as_ref().map(String::len) == Some(64)));
}

#[cfg(unix)]
#[test]
fn test_restage_keeps_file_identity() {
    use std::os::unix::fs::MetadataExt;

    let mut fx = Fixture::new();
    let sources = fx.series("s", "1", "CT", 1, 4);
    let bundler = Bundler::new(fx.staging(), StageOptions::default());

    let first = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();
    let second = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();

    assert_eq!(first.staged[0].files_linked, 4);
    assert_eq!(second.staged[0].files_already_staged, 4);
    assert_eq!(second.files_placed(), 4);

    let staged_dir = fx.staging().join("s_1/CT/1");
    assert_eq!(fs::read_dir(&staged_dir).unwrap().count(), 4);
    for source in &sources {
        let staged = staged_dir.join(source.file_name().unwrap());
        assert_eq!(
            fs::metadata(source).unwrap().ino(),
            fs::metadata(&staged).unwrap().ino()
        );
    }

    let manifest = BundleManifest::read(&fx.staging().join("s_1")).unwrap();
    assert_eq!(manifest.groups.len(), 1);
    assert_eq!(manifest.file_count(), 4);
}

#[test]
fn test_placement_failure_keeps_sources() {
    let mut fx = Fixture::new();
    let sources = fx.series("s", "1", "PET", 1, 5);

    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            delete_source: true,
            ..Default::default()
        },
    )
    .with_placer(Arc::new(FailingPlacer {
        placed: AtomicUsize::new(0),
        fail_at: 3,
    }));
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.exit_code(), EXIT_PARTIAL);
    assert!(summary.failed[0].error.contains("injected placement failure"));
    for source in &sources {
        assert!(source.exists(), "{} was deleted", source.display());
    }
    assert!(!fx.staging().join("s_1").join(MANIFEST_FILE).exists());
}

#[test]
fn test_delete_source_after_verified_placement() {
    let mut fx = Fixture::new();
    let sources = fx.series("s", "1", "PET", 1, 2);
    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            delete_source: true,
            ..Default::default()
        },
    );
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();

    assert_eq!(summary.staged[0].sources_deleted, 2);
    for source in &sources {
        assert!(!source.exists());
        let staged = fx.staging().join("s_1/PET/1").join(source.file_name().unwrap());
        assert!(staged.is_file());
    }
}

#[test]
fn test_conflict_only_fails_its_session() {
    let mut fx = Fixture::new();
    let good = fx.series("good", "1", "CT", 3, 2);

    // One series whose files share a name in different source directories
    for dir in ["a", "b"] {
        let path = fx.source().join(dir).join("img.dcm");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, dir).unwrap();
        fx.classifier.insert(
            &path,
            RecognizedFile {
                acquisition_tag: "PET".to_string(),
                logical_type: DICOM_SERIES_TYPE.to_string(),
                series_id: "1.2.3.1".to_string(),
                metadata: Metadata::new()
                    .with("PatientID", "bad")
                    .with("AccessionNumber", "1"),
            },
        );
    }

    let bundler = Bundler::new(fx.staging(), StageOptions::default());
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();

    assert_eq!(summary.staged.len(), 1);
    assert_eq!(summary.staged[0].session, "good_1");
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].session, "bad_1");
    assert_eq!(summary.failed[0].category, "staging");
    assert!(fx.staging().join("good_1/CT/1").join(good[0].file_name().unwrap()).is_file());
    assert!(!fx.staging().join("bad_1").exists());
}

#[test]
fn test_fail_fast_stops_remaining_sessions() {
    let mut fx = Fixture::new();
    fx.series("a", "1", "PET", 1, 2);
    fx.series("b", "1", "PET", 1, 2);
    fx.series("c", "1", "PET", 1, 2);

    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            fail_fast: true,
            workers: 1,
            ..Default::default()
        },
    )
    .with_placer(Arc::new(FailingPlacer {
        placed: AtomicUsize::new(0),
        fail_at: 0,
    }));
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();

    assert!(summary.aborted);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].session, "a_1");
    assert_eq!(summary.not_started, vec!["b_1".to_string(), "c_1".to_string()]);
    assert_eq!(summary.exit_code(), EXIT_PARTIAL);
}

#[test]
fn test_unresolved_identifier_is_reported() {
    let mut fx = Fixture::new();
    fx.series("s", "1", "CT", 1, 1);
    let orphan = fx.source().join("orphan.dcm");
    fs::write(&orphan, b"no accession").unwrap();
    fx.classifier.insert(
        &orphan,
        RecognizedFile {
            acquisition_tag: "CT".to_string(),
            logical_type: DICOM_SERIES_TYPE.to_string(),
            series_id: "9.9".to_string(),
            metadata: Metadata::new().with("PatientID", "s"),
        },
    );

    let bundler = Bundler::new(fx.staging(), StageOptions::default());
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();
    assert_eq!(summary.staged.len(), 1);
    assert_eq!(summary.unresolved.len(), 1);
    assert!(summary.unresolved[0].contains("AccessionNumber"));

    let strict = Bundler::new(
        fx.root.path().join("strict"),
        StageOptions {
            fail_fast: true,
            ..Default::default()
        },
    );
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &strict).unwrap();
    assert!(summary.aborted);
    assert!(summary.staged.is_empty());
    assert_eq!(summary.not_started, vec!["s_1".to_string()]);
}

#[test]
fn test_unmatched_raw_files_are_unclaimed() {
    let mut fx = Fixture::new();
    fx.series("s", "1", "PET", 1, 1);
    fx.raw_file("1_COUNTRATE.ptd");
    fx.raw_file("7_LISTMODE.ptd");
    fx.raw_file("notes.ptd");

    let bundler = Bundler::new(fx.staging(), StageOptions::default());
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[fx.raw_spec()], &bundler).unwrap();

    assert_eq!(summary.staged.len(), 1);
    assert_eq!(summary.unclaimed.len(), 2);
    let reasons: Vec<_> = summary
        .unclaimed
        .iter()
        .map(|u| (u.path.file_name().unwrap().to_string_lossy().into_owned(), u.reason))
        .collect();
    assert!(reasons.contains(&("7_LISTMODE.ptd".to_string(), UnclaimedReason::NoMatchingItem)));
    assert!(reasons.contains(&("notes.ptd".to_string(), UnclaimedReason::PatternMismatch)));
    assert!(fx
        .staging()
        .join("s_1/PET/1/resources/COUNTRATE/1_COUNTRATE.ptd")
        .is_file());
}

#[test]
fn test_dry_run_leaves_staging_root_empty() {
    let mut fx = Fixture::new();
    fx.series("s", "1", "PET", 1, 2);
    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            dry_run: true,
            ..Default::default()
        },
    );
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();
    assert!(summary.staged[0].dry_run);
    assert!(!fx.staging().exists());
}

#[test]
fn test_sessions_sharing_a_bundle_name_are_not_merged() {
    let mut fx = Fixture::new();
    let first = fx.series("a_b", "c", "PET", 1, 2);
    let second = fx.series("a", "b_c", "CT", 2, 2);

    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            delete_source: true,
            ..Default::default()
        },
    );
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();

    assert!(summary.staged.is_empty());
    assert_eq!(summary.failed.len(), 2);
    assert!(summary.failed.iter().all(|f| f.category == "staging"));
    assert_eq!(summary.exit_code(), EXIT_PARTIAL);
    assert!(first.iter().chain(&second).all(|p| p.is_file()));
    assert!(!fx.staging().join("a_b_c").exists());
}

#[test]
fn test_bundle_owned_by_another_session_is_left_alone() {
    let mut fx = Fixture::new();
    fx.series("a_b", "c", "PET", 1, 2);
    let bundler = Bundler::new(fx.staging(), StageOptions::default());
    let summary = run_stage(&fx.source(), &fx.classifier, &extractor(), &[], &bundler).unwrap();
    assert_eq!(summary.staged.len(), 1);

    let mut later = Fixture::new();
    let sources = later.series("a", "b_c", "CT", 2, 1);
    let bundler = Bundler::new(
        fx.staging(),
        StageOptions {
            delete_source: true,
            ..Default::default()
        },
    );
    let summary = run_stage(&later.source(), &later.classifier, &extractor(), &[], &bundler).unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].category, "staging");
    assert!(summary.failed[0].error.contains(MANIFEST_FILE));
    assert!(sources[0].is_file());

    let bundle = fx.staging().join("a_b_c");
    let manifest = BundleManifest::read(&bundle).unwrap();
    assert_eq!(manifest.session.subject, "a_b");
    assert_eq!(manifest.file_count(), 2);
    assert!(!bundle.join("CT").exists());
}
