//! Chroot jail management
//!
//! This module provides:
//! - Bind mount bookkeeping for a jail root (see `ledger`)
//! - The root switch into and back out of a jail
//! - Command execution inside a jail
//!
//! The process root is process-wide state. Only one jail may be entered at
//! a time per process; callers serialize `run_callback`/`run` themselves.

pub mod ledger;

pub use ledger::MountLedger;

use crate::error::{Error, Result};
use crate::runner::Context;
use crate::sys::{Capabilities, RootHandle, RootSwitch};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Paths bind mounted into every jail unless overridden
pub const DEFAULT_BINDS: [&str; 4] = ["/dev", "/dev/pts", "/proc", "/sys"];

/// A chroot jail rooted at `path`
///
/// Mounts are owned between a successful `prepare` and the matching `close`.
/// A jail dropped while it still owns mounts tears them down on a best-effort
/// basis.
pub struct Jail<'a> {
    caps: &'a Capabilities,
    path: PathBuf,
    default_binds: Vec<PathBuf>,
    /// host path -> path inside the jail, mounted in host path order
    extra_binds: BTreeMap<PathBuf, PathBuf>,
    ledger: MountLedger,
}

impl<'a> Jail<'a> {
    pub fn new(path: impl Into<PathBuf>, caps: &'a Capabilities) -> Self {
        Self {
            caps,
            path: path.into(),
            default_binds: DEFAULT_BINDS.iter().map(PathBuf::from).collect(),
            extra_binds: BTreeMap::new(),
            ledger: MountLedger::new(),
        }
    }

    /// Replace the default bind list; an empty list disables it
    pub fn with_default_binds<I, P>(mut self, binds: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.default_binds = binds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra_binds(mut self, binds: BTreeMap<PathBuf, PathBuf>) -> Self {
        self.extra_binds = binds;
        self
    }

    /// Takes effect on the next preparation
    pub fn set_extra_binds(&mut self, binds: BTreeMap<PathBuf, PathBuf>) {
        self.extra_binds = binds;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_binds(&self) -> &[PathBuf] {
        &self.default_binds
    }

    pub fn extra_binds(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.extra_binds
    }

    /// Jail-side mount targets, in mount order
    pub fn active_mounts(&self) -> &[PathBuf] {
        self.ledger.active()
    }

    /// Mount targets created to host a file bind
    pub fn touched_files(&self) -> &[PathBuf] {
        self.ledger.touched()
    }

    pub fn is_prepared(&self) -> bool {
        !self.ledger.is_idle()
    }

    /// Establish all bind mounts without entering the jail.
    ///
    /// The mounts stay until `close`; `run_callback` leaves them in place.
    pub fn prepare(&mut self) -> Result<()> {
        let root = if self.path.is_absolute() {
            normalize(&self.path)
        } else {
            let cwd = self.current_dir()?;
            self.resolve(&cwd)
        };

        self.ledger
            .prepare_all(self.caps, &root, &self.default_binds, &self.extra_binds)
    }

    /// Unmount everything this jail holds, innermost first.
    ///
    /// A no-op when nothing is mounted.
    pub fn close(&mut self) -> Result<()> {
        if self.ledger.is_idle() {
            return Ok(());
        }
        self.ledger.teardown_all(self.caps)
    }

    /// Run `callback` with the process rooted in the jail.
    ///
    /// Mounts are prepared first unless the jail is already prepared, in
    /// which case they are also left in place afterwards. The original root
    /// and working directory are restored whatever the callback returns.
    pub fn run_callback<T, F>(&mut self, callback: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let cwd = self.current_dir()?;
        let root = self.resolve(&cwd);

        let original = self.caps.root.open_root().map_err(|e| Error::RootSwitch {
            op: "open",
            path: PathBuf::from("/"),
            source: e,
        })?;

        let owns_mounts = self.ledger.is_idle();
        if owns_mounts {
            self.ledger
                .prepare_all(self.caps, &root, &self.default_binds, &self.extra_binds)?;
        }

        let result = enter(&*self.caps.root, &root, &cwd, original, callback);

        if owns_mounts && let Err(teardown) = self.ledger.teardown_all(self.caps) {
            return Err(match result {
                Ok(_) => teardown,
                Err(err) => err.with([teardown]),
            });
        }

        result
    }

    /// Run a command inside the jail and return its combined output
    pub fn run(&mut self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let caps = self.caps;
        let jail = self.path.clone();
        self.run_callback(|| {
            caps.runner
                .run(command, args)
                .inspect_err(|err| log_command_failure(&jail, command, args, err))
        })
    }

    /// Like `run`, killing the command once `ctx` is done
    pub fn run_with_context(
        &mut self,
        ctx: &Context,
        command: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let caps = self.caps;
        let jail = self.path.clone();
        self.run_callback(|| {
            caps.runner
                .run_with_context(ctx, command, args)
                .inspect_err(|err| log_command_failure(&jail, command, args, err))
        })
    }

    fn current_dir(&self) -> Result<PathBuf> {
        self.caps
            .root
            .current_dir()
            .map_err(|e| Error::PathResolution {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Absolute, normalized jail root
    fn resolve(&self, cwd: &Path) -> PathBuf {
        if self.path.is_absolute() {
            return normalize(&self.path);
        }

        let root = normalize(&cwd.join(&self.path));
        log::warn!(
            "Jail path {} is relative, using {}",
            self.path.display(),
            root.display()
        );
        root
    }
}

impl Drop for Jail<'_> {
    fn drop(&mut self) {
        if self.ledger.is_idle() {
            return;
        }

        log::warn!(
            "Jail {} dropped with {} active mounts, tearing down",
            self.path.display(),
            self.ledger.active().len()
        );
        if let Err(e) = self.ledger.teardown_all(self.caps) {
            log::error!("Failed to tear down jail {}: {}", self.path.display(), e);
        }
    }
}

/// Build a jail with the default binds plus `extra_binds` and run `callback`
/// inside it
pub fn chrooted<T, F>(
    caps: &Capabilities,
    path: impl Into<PathBuf>,
    extra_binds: BTreeMap<PathBuf, PathBuf>,
    callback: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    Jail::new(path, caps)
        .with_extra_binds(extra_binds)
        .run_callback(callback)
}

/// Switch into `root`, run `callback`, and switch back
fn enter<T, F>(
    switch: &dyn RootSwitch,
    root: &Path,
    cwd: &Path,
    original: RootHandle,
    callback: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    switch.chdir(root).map_err(|e| Error::RootSwitch {
        op: "chdir",
        path: root.to_path_buf(),
        source: e,
    })?;

    if let Err(e) = switch.chroot(root) {
        if let Err(back) = switch.chdir(cwd) {
            log::error!("Failed to return to {}: {}", cwd.display(), back);
        }
        return Err(Error::RootSwitch {
            op: "chroot",
            path: root.to_path_buf(),
            source: e,
        });
    }

    let guard = RootGuard {
        switch,
        original,
        cwd,
        restored: false,
    };
    let result = callback();
    let restored = guard.restore();

    match (result, restored) {
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Returns the process to its original root when dropped
struct RootGuard<'r> {
    switch: &'r dyn RootSwitch,
    original: RootHandle,
    cwd: &'r Path,
    restored: bool,
}

impl RootGuard<'_> {
    fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.switch_back()
    }

    /// fchdir to the saved root, chroot ".", then back to the entry directory
    fn switch_back(&self) -> Result<()> {
        let result = self
            .switch
            .fchdir(&self.original)
            .map_err(|e| ("fchdir", e))
            .and_then(|()| {
                self.switch
                    .chroot(Path::new("."))
                    .map_err(|e| ("chroot", e))
            })
            .and_then(|()| self.switch.chdir(self.cwd).map_err(|e| ("chdir", e)));

        result.map_err(|(op, source)| {
            let err = Error::Restore { op, source };
            log::error!("{}; process may be left inside the jail", err);
            err
        })
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        if !self.restored {
            // Errors are already logged
            let _ = self.switch_back();
        }
    }
}

fn log_command_failure(jail: &Path, command: &str, args: &[&str], err: &Error) {
    log::error!(
        "Can't run command {} with args {:?} on chroot {}: {}",
        command,
        args,
        jail.display(),
        err
    );
    if let Error::CommandExit { output, .. } = err {
        log::debug!("Output: {}", String::from_utf8_lossy(output));
    }
}

/// Lexically fold `.` and `..` out of an absolute path
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
