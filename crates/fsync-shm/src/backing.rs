//! Locating and opening the authority's backing file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fsync_error::{FsyncError, Result};
use tracing::debug;

/// Prefix of every backing file name.
pub const BACKING_PREFIX: &str = "fsync";

/// Name of the backing file for the given configuration directory.
///
/// The name is derived from the directory's inode number so that every
/// process sharing the directory, and the authority serving it, agree on
/// the file without exchanging it.
pub fn backing_file_name(config_dir: &Path) -> Result<String> {
    let meta = std::fs::metadata(config_dir)?;
    Ok(format!("{BACKING_PREFIX}-{:x}", meta.ino()))
}

/// Open an existing backing file read/write. Never creates it.
///
/// # Errors
///
/// A missing file is [`FsyncError::BackingFileMissing`]; the authority is the
/// only party allowed to create it. Other failures are [`FsyncError::Io`].
pub fn open_backing_file(path: &Path) -> Result<File> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => {
            debug!(target: "fsync_shm::backing", path = %path.display(), "opened backing file");
            Ok(file)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(FsyncError::BackingFileMissing {
            path: PathBuf::from(path),
        }),
        Err(err) => Err(FsyncError::Io(err)),
    }
}
