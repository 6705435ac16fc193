//! Filesystem seam for backup snapshots.
//!
//! Snapshot writes go through [`FileSystem`] so their failure paths can be
//! driven from tests with `MockFileSystem`.

use std::fs::{OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait FileSystem: Send + Sync {
    /// Create or truncate `path` and write `contents`.
    ///
    /// `mode` is in effect before the first byte is written, also when the
    /// file already existed with a wider mode.
    fn write_with_mode(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// [`FileSystem`] over `std::fs`.
#[derive(Default, Clone, Copy)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn write_with_mode(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        // mode() only applies on creation
        file.set_permissions(Permissions::from_mode(mode))?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

static REAL_FS: RealFileSystem = RealFileSystem;

/// Shared production filesystem instance.
pub fn real_fs() -> &'static RealFileSystem {
    &REAL_FS
}

/// Write `contents` to `path`, readable by the owner only.
///
/// Snapshots contain the full blocklist, so they get the same 0600 mode
/// as the config file.
pub fn write_private(fs: &dyn FileSystem, path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !fs.exists(parent) {
            fs.create_dir_all(parent)?;
        }
    }
    fs.write_with_mode(path, contents, 0o600)
}
