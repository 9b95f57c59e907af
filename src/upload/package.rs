/*!
 * Packaging of one transfer unit into a single archive
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{IngestError, Result};

/// Archive format used for transfer units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PackagingMethod {
    /// Uncompressed tar
    #[default]
    Tar,
    /// Gzip-compressed tar
    TarGz,
}

impl PackagingMethod {
    pub fn extension(&self) -> &'static str {
        match self {
            PackagingMethod::Tar => "tar",
            PackagingMethod::TarGz => "tar.gz",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            PackagingMethod::Tar => "application/x-tar",
            PackagingMethod::TarGz => "application/gzip",
        }
    }
}

/// An archive on disk, removed when dropped
#[derive(Debug)]
pub struct PackagedArchive {
    file: NamedTempFile,
    pub method: PackagingMethod,
    pub size: u64,
    pub entries: usize,
}

impl PackagedArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Write `files` (relative to `base_dir`) into a temporary archive.
/// Entry names keep the relative layout.
pub fn package(
    base_dir: &Path,
    files: &[PathBuf],
    method: PackagingMethod,
    temp_dir: Option<&Path>,
) -> Result<PackagedArchive> {
    let suffix = format!(".{}", method.extension());
    let mut builder = tempfile::Builder::new();
    builder.prefix("xingest-").suffix(&suffix);
    let tmp = match temp_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };

    let writer = BufWriter::new(tmp.reopen()?);
    match method {
        PackagingMethod::Tar => {
            let mut inner = append_all(tar::Builder::new(writer), base_dir, files)?;
            inner.flush()?;
        }
        PackagingMethod::TarGz => {
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut inner = append_all(tar::Builder::new(encoder), base_dir, files)?.finish()?;
            inner.flush()?;
        }
    }

    let size = tmp.as_file().metadata()?.len();
    debug!(
        archive = %tmp.path().display(),
        entries = files.len(),
        bytes = size,
        "packaged transfer unit"
    );
    Ok(PackagedArchive {
        file: tmp,
        method,
        size,
        entries: files.len(),
    })
}

fn append_all<W: Write>(mut builder: tar::Builder<W>, base_dir: &Path, files: &[PathBuf]) -> Result<W> {
    for relative in files {
        let full = base_dir.join(relative);
        let mut file = File::open(&full).map_err(|e| {
            IngestError::Io(std::io::Error::new(
                e.kind(),
                format!("missing staged file {}: {}", full.display(), e),
            ))
        })?;
        builder.append_file(relative, &mut file)?;
    }
    Ok(builder.into_inner()?)
}

/// Package on the blocking pool
pub async fn package_async(
    base_dir: PathBuf,
    files: Vec<PathBuf>,
    method: PackagingMethod,
    temp_dir: Option<PathBuf>,
) -> Result<PackagedArchive> {
    tokio::task::spawn_blocking(move || package(&base_dir, &files, method, temp_dir.as_deref()))
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))?
}
