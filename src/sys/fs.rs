//! Filesystem capability

use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

/// Directory permissions for created mount targets
const DIR_MODE: u32 = 0o755;

/// File permissions for created mount targets
const FILE_MODE: u32 = 0o644;

/// What a path resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
    /// Device nodes, sockets, fifos
    Other,
}

/// Filesystem operations the mount ledger relies on
pub trait Filesystem {
    /// Stat a path, following symlinks
    fn stat(&self, path: &Path) -> io::Result<FileKind>;

    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Create a directory and any missing parents
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Create an empty file, leaving an existing one untouched
    fn create_file(&self, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// `Filesystem` over `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl Filesystem for OsFs {
    fn stat(&self, path: &Path) -> io::Result<FileKind> {
        let file_type = fs::metadata(path)?.file_type();
        Ok(if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        })
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(DIR_MODE).create(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(FILE_MODE)
            .open(path)
            .map(drop)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}
