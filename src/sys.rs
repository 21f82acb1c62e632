//! Capability ports over OS primitives
//!
//! The jail controller never touches the kernel directly. It goes through:
//! - `Mounter` for mount/unmount and mount table queries
//! - `RootSwitch` for chroot/chdir and the original-root handle
//! - `Filesystem` for stat and mount target creation/removal
//! - `Runner` (see `crate::runner`) for child processes

pub mod fs;
pub mod mount;
pub mod root;

pub use fs::{FileKind, Filesystem, OsFs};
pub use mount::{MountPoint, Mounter, SysMounter};
pub use root::{RootHandle, RootSwitch, SysRoot};

use crate::runner::{Runner, SysRunner};

/// The set of capabilities a jail is driven through
pub struct Capabilities {
    pub mounter: Box<dyn Mounter>,
    pub root: Box<dyn RootSwitch>,
    pub fs: Box<dyn Filesystem>,
    pub runner: Box<dyn Runner>,
}

impl Capabilities {
    /// Capabilities backed by the running kernel
    pub fn system() -> Self {
        Self {
            mounter: Box::new(SysMounter),
            root: Box::new(SysRoot),
            fs: Box::new(OsFs),
            runner: Box::new(SysRunner),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::system()
    }
}
