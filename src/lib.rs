//! Drydock - chroot jails for build and provisioning commands
//!
//! Bind mounts the paths a root filesystem needs, switches the process root
//! into it, runs work there, and restores the original root and mounts
//! afterwards, reporting every failure along the way.

pub mod cleanstack;
pub mod cli;
pub mod error;
pub mod jail;
pub mod manifest;
pub mod runner;
pub mod sys;

#[cfg(test)]
mod testing;

pub use cleanstack::{CleanJob, CleanStack};
pub use error::{Error, Result};
pub use jail::{DEFAULT_BINDS, Jail, MountLedger, chrooted};
pub use runner::{Context, Runner, SysRunner};
pub use sys::Capabilities;
