/*!
 * Placement of source files into a staged bundle.
 *
 * Staged files are hard links to their sources whenever source and bundle
 * share a filesystem, so staging costs the same for a 1 KiB topogram and a
 * 20 GiB list-mode stream. Linking falls back to a byte copy when the link
 * cannot be made (cross-device, unsupported filesystem).
 */

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::checksum::file_digest;

/// How a staged file came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMethod {
    HardLink,
    Copy,
    /// An identical file was already staged at the destination
    AlreadyStaged,
}

/// Link policy for staging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Hard link, copying when linking fails
    #[default]
    HardlinkOrCopy,
    /// Always copy bytes
    Copy,
}

/// Places one source file at a staged destination
pub trait FilePlacer: Send + Sync {
    fn place(&self, source: &Path, dest: &Path) -> io::Result<PlacementMethod>;
}

/// Default placer: hard link with copy fallback
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOrCopyPlacer {
    pub mode: LinkMode,
}

impl LinkOrCopyPlacer {
    pub fn new(mode: LinkMode) -> Self {
        Self { mode }
    }
}

impl FilePlacer for LinkOrCopyPlacer {
    fn place(&self, source: &Path, dest: &Path) -> io::Result<PlacementMethod> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if dest.exists() {
            if is_same_content(source, dest)? {
                trace!(dest = %dest.display(), "already staged");
                return Ok(PlacementMethod::AlreadyStaged);
            }
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists with different content", dest.display()),
            ));
        }

        if self.mode == LinkMode::HardlinkOrCopy {
            match fs::hard_link(source, dest) {
                Ok(()) => return Ok(PlacementMethod::HardLink),
                Err(e) => {
                    debug!(source = %source.display(), error = %e, "hard link failed, copying");
                }
            }
        }

        fs::copy(source, dest)?;
        Ok(PlacementMethod::Copy)
    }
}

/// Whether two paths hold the same data: same inode, or same size and digest
pub fn is_same_content(a: &Path, b: &Path) -> io::Result<bool> {
    let ma = fs::metadata(a)?;
    let mb = fs::metadata(b)?;

    if same_inode(&ma, &mb) {
        return Ok(true);
    }
    if ma.len() != mb.len() {
        return Ok(false);
    }

    let da = file_digest(a).map_err(io::Error::other)?;
    let db = file_digest(b).map_err(io::Error::other)?;
    Ok(da == db)
}

#[cfg(unix)]
fn same_inode(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_inode(_a: &fs::Metadata, _b: &fs::Metadata) -> bool {
    false
}

/// Confirm a staged file exists, is readable and has the source's length
pub fn verify_placed(source: &Path, dest: &Path) -> io::Result<()> {
    let expected = fs::metadata(source)?.len();
    let mut file = File::open(dest)?;
    let actual = file.metadata()?.len();
    if actual != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "staged file {} is {} bytes, expected {}",
                dest.display(),
                actual,
                expected
            ),
        ));
    }
    if expected > 0 {
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte)?;
    }
    Ok(())
}
