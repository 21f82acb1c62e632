//! Root-switch capability
//!
//! chroot(2) and the working directory are process-wide: only one thread
//! may have the root switched at a time, and callers serialize access.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

/// Open handle on the root directory a process started from
///
/// Restoring through the handle does not depend on path lookups, which would
/// resolve inside the jail once the root has been switched.
#[derive(Debug)]
pub struct RootHandle {
    dir: Option<OwnedFd>,
}

impl RootHandle {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { dir: Some(fd) }
    }

    /// A handle with no descriptor behind it, for implementations that do
    /// not switch a real root
    pub fn detached() -> Self {
        Self { dir: None }
    }

    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.dir.as_ref().map(|fd| fd.as_fd())
    }
}

/// Process root and working directory operations
pub trait RootSwitch {
    fn current_dir(&self) -> io::Result<PathBuf>;

    /// Open the current root so it can be returned to later
    fn open_root(&self) -> io::Result<RootHandle>;

    fn chroot(&self, path: &Path) -> io::Result<()>;

    fn chdir(&self, path: &Path) -> io::Result<()>;

    /// Change the working directory to the directory behind `handle`
    fn fchdir(&self, handle: &RootHandle) -> io::Result<()>;
}

/// `RootSwitch` backed by the running kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct SysRoot;

impl RootSwitch for SysRoot {
    fn current_dir(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn open_root(&self) -> io::Result<RootHandle> {
        let dir = File::open("/")?;
        Ok(RootHandle::from_fd(OwnedFd::from(dir)))
    }

    fn chroot(&self, path: &Path) -> io::Result<()> {
        log::debug!("chroot {}", path.display());
        nix::unistd::chroot(path)?;
        Ok(())
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        nix::unistd::chdir(path)?;
        Ok(())
    }

    fn fchdir(&self, handle: &RootHandle) -> io::Result<()> {
        let fd = handle.as_fd().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "root handle is not backed by a descriptor",
            )
        })?;

        nix::unistd::fchdir(fd)?;
        Ok(())
    }
}
