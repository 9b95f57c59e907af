/*!
 * Bundle manifest written at the root of every staged session
 *
 * The manifest records what the directory layout cannot: the session key,
 * each group's logical type and description, and where every staged file
 * came from. The layout itself stays authoritative for file locations.
 */

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifier::{SessionKey, SortKey};
use super::placement::PlacementMethod;
use crate::error::Result;

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Directory holding auxiliary resources inside a group
pub const RESOURCES_DIR: &str = "resources";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the bundle root
    pub path: PathBuf,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub source: PathBuf,
    pub method: PlacementMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub resource_tag: String,
    pub logical_type: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub acquisition_tag: String,
    pub index: usize,
    pub series_id: String,
    /// Remote scan id, usually the series number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub logical_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<SortKey>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

impl GroupEntry {
    /// `{tag}/{index}` relative to the bundle root
    pub fn relative_dir(&self) -> PathBuf {
        group_dir(&self.acquisition_tag, self.index)
    }
}

pub fn group_dir(tag: &str, index: usize) -> PathBuf {
    PathBuf::from(super::identifier::sanitize(tag)).join(index.to_string())
}

pub fn resource_dir(tag: &str, index: usize, resource: &str) -> PathBuf {
    group_dir(tag, index)
        .join(RESOURCES_DIR)
        .join(super::identifier::sanitize(resource))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u32,
    pub session: SessionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub created: DateTime<Utc>,
    pub groups: Vec<GroupEntry>,
}

impl BundleManifest {
    pub fn new(session: SessionKey, project: Option<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            session,
            project,
            created: Utc::now(),
            groups: Vec::new(),
        }
    }

    pub fn path(bundle_dir: &Path) -> PathBuf {
        bundle_dir.join(MANIFEST_FILE)
    }

    pub fn read(bundle_dir: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(Self::path(bundle_dir))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write atomically: a temp file in the bundle directory is renamed over
    /// any previous manifest
    pub fn write(&self, bundle_dir: &Path) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(bundle_dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::path(bundle_dir))
            .map_err(|e| crate::error::IngestError::Io(e.error))?;
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.files.len() + g.resources.iter().map(|r| r.files.len()).sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            size: 3,
            sha256: None,
            source: PathBuf::from("/src").join(path),
            method: PlacementMethod::HardLink,
        }
    }

    #[test]
    fn test_manifest_write_and_read() {
        let dir = tempdir().unwrap();
        let mut manifest = BundleManifest::new(SessionKey::new("subject0", "987654320"), None);
        manifest.groups.push(GroupEntry {
            acquisition_tag: "PET".to_string(),
            index: 1,
            series_id: "1.2.3".to_string(),
            scan_id: Some("602".to_string()),
            description: Some("PET SWB 8MIN".to_string()),
            logical_type: "medimage/dicom-series".to_string(),
            sort_key: None,
            files: vec![entry("PET/1/a.dcm")],
            resources: vec![ResourceEntry {
                resource_tag: "LISTMODE".to_string(),
                logical_type: "raw".to_string(),
                files: vec![entry("PET/1/resources/LISTMODE/a.ptd")],
            }],
        });

        manifest.write(dir.path()).unwrap();
        let loaded = BundleManifest::read(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.file_count(), 2);
        assert_eq!(loaded.groups[0].relative_dir(), PathBuf::from("PET/1"));
    }

    #[test]
    fn test_layout_paths() {
        assert_eq!(
            resource_dir("PET", 2, "LISTMODE"),
            PathBuf::from("PET/2/resources/LISTMODE")
        );
    }
}
