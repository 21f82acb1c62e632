//! Mount ledger
//!
//! Records which bind mounts a jail holds, in the order they were made, and
//! which mount target files were created only to host a mount.

use super::normalize;
use crate::error::{Error, Result};
use crate::sys::{Capabilities, FileKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bind mounts currently held by one jail
///
/// `active` is in acquisition order; teardown walks it backwards so nested
/// targets are released before their parents. Every `touched` entry is also
/// in `active`.
#[derive(Debug, Default)]
pub struct MountLedger {
    active: Vec<PathBuf>,
    touched: Vec<PathBuf>,
}

impl MountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// No teardown is owed
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active(&self) -> &[PathBuf] {
        &self.active
    }

    pub fn touched(&self) -> &[PathBuf] {
        &self.touched
    }

    /// Bind mount `source` on `target`, creating the target if needed
    pub fn bind(&mut self, caps: &Capabilities, source: &Path, target: &Path) -> Result<()> {
        let kind = caps.fs.stat(source).map_err(|e| Error::Stat {
            path: source.to_path_buf(),
            source: e,
        })?;

        let created = match kind {
            FileKind::Directory => {
                create_dir(caps, target)?;
                false
            }
            FileKind::File | FileKind::Other => {
                if let Some(parent) = target.parent() {
                    create_dir(caps, parent)?;
                }
                let exists = caps.fs.exists(target).map_err(|e| Error::Stat {
                    path: target.to_path_buf(),
                    source: e,
                })?;
                if !exists {
                    caps.fs.create_file(target).map_err(|e| Error::FileCreate {
                        path: target.to_path_buf(),
                        source: e,
                    })?;
                }
                !exists
            }
        };

        if let Err(e) = caps.mounter.mount(source, target, Some("bind"), &["bind"]) {
            if created && let Err(rm) = caps.fs.remove_file(target) {
                log::warn!("Failed to remove mount target {}: {}", target.display(), rm);
            }
            return Err(Error::Mount {
                from: source.to_path_buf(),
                target: target.to_path_buf(),
                source: e,
            });
        }

        log::debug!("Bind mounted {} on {}", source.display(), target.display());
        self.active.push(target.to_path_buf());
        if created {
            self.touched.push(target.to_path_buf());
        }

        Ok(())
    }

    /// Bind every default path, then every extra bind in host path order.
    ///
    /// Fails without side effects when mounts are already held. On the first
    /// failure everything mounted so far is torn down again.
    pub fn prepare_all(
        &mut self,
        caps: &Capabilities,
        root: &Path,
        defaults: &[PathBuf],
        extras: &BTreeMap<PathBuf, PathBuf>,
    ) -> Result<()> {
        if !self.is_idle() {
            return Err(Error::AlreadyPrepared(root.to_path_buf()));
        }

        // Every target is checked before anything is mounted
        let plan = defaults
            .iter()
            .map(|path| jail_target(root, path).map(|target| (path, target)))
            .chain(
                extras
                    .iter()
                    .map(|(host, inside)| jail_target(root, inside).map(|target| (host, target))),
            )
            .collect::<Result<Vec<_>>>()?;

        for (source, target) in plan {
            if self.active.contains(&target) {
                log::warn!("{} is mounted more than once", target.display());
            }
            if let Err(err) = self.bind(caps, source, &target) {
                log::error!("Failed to prepare jail {}: {}", root.display(), err);
                return Err(match self.teardown_all(caps) {
                    Ok(()) => err,
                    Err(rollback) => err.with([rollback]),
                });
            }
        }

        Ok(())
    }

    /// Unmount everything in reverse acquisition order.
    ///
    /// A failing unmount does not stop the others; the mounts that could not
    /// be released stay in the ledger so a retry only targets those.
    pub fn teardown_all(&mut self, caps: &Capabilities) -> Result<()> {
        let mut still_active = Vec::new();
        let mut errors = Vec::new();

        for target in std::mem::take(&mut self.active).into_iter().rev() {
            if let Err(e) = caps.mounter.unmount(&target) {
                log::error!("Failed to unmount {}: {}", target.display(), e);
                errors.push(Error::Unmount {
                    path: target.clone(),
                    source: e,
                });
                still_active.push(target);
                continue;
            }

            if let Some(idx) = self.touched.iter().position(|t| *t == target) {
                self.touched.remove(idx);
                if let Err(e) = caps.fs.remove_file(&target) {
                    errors.push(Error::FileRemove {
                        path: target.clone(),
                        source: e,
                    });
                }
            }
        }

        // Back to acquisition order
        still_active.reverse();
        self.active = still_active;

        match Error::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Where `path` lands inside a jail rooted at `root`
///
/// The result is normalized and must stay under `root`.
pub(crate) fn jail_target(root: &Path, path: &Path) -> Result<PathBuf> {
    let root = normalize(root);
    let target = normalize(&root.join(path.strip_prefix("/").unwrap_or(path)));
    if !target.starts_with(&root) {
        return Err(Error::BindEscape {
            target: path.to_path_buf(),
            root,
        });
    }
    Ok(target)
}

fn create_dir(caps: &Capabilities, path: &Path) -> Result<()> {
    caps.fs.create_dir_all(path).map_err(|e| Error::DirCreate {
        path: path.to_path_buf(),
        source: e,
    })
}
