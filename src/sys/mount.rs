//! Mount capability
//!
//! Provides:
//! - The `Mounter` port used by the mount ledger
//! - `SysMounter`, backed by mount(2)/umount2(2) and the procfs mount tables
//! - `MountPoint` records with credential-safe formatting

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Mount table of the calling process
const MOUNTS: &str = "/proc/self/mounts";

/// Extended mount table (device, root and mount point per entry)
const MOUNTINFO: &str = "/proc/self/mountinfo";

/// A mounted filesystem as reported by the kernel
///
/// `options` may carry credentials (e.g. `password=` on network mounts),
/// so it is never printed by `Debug` and never serialized.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    /// Mounted device or source
    pub device: String,
    /// Mount point
    pub path: PathBuf,
    /// Filesystem type
    #[serde(rename = "type")]
    pub fstype: String,
    /// Mount options
    #[serde(skip)]
    pub options: Vec<String>,
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountPoint")
            .field("device", &self.device)
            .field("path", &self.path)
            .field("fstype", &self.fstype)
            .field("options", &"<redacted>")
            .finish()
    }
}

/// Mount operations
pub trait Mounter {
    /// Mount `source` on `target`.
    ///
    /// `fstype` of `None` or `"bind"` means no filesystem type; `options`
    /// are mount(8)-style words such as `bind`, `ro` or `size=1G`.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Whether `path` is the root of a mount
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    /// Other mount points exposing the same content as `path`
    fn mount_refs(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// The current mount table
    fn list(&self) -> io::Result<Vec<MountPoint>>;
}

/// `Mounter` backed by the running kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> io::Result<()> {
        let (flags, data) = mount_flags(options);
        let fstype = fstype.filter(|t| !t.is_empty() && *t != "bind");

        log::debug!(
            "Mounting {} on {} (type: {})",
            source.display(),
            target.display(),
            fstype.unwrap_or("none")
        );

        // MS_RDONLY is ignored on the initial bind and needs a remount
        let readonly_bind = flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY)
            && !flags.contains(MsFlags::MS_REMOUNT);
        let initial = if readonly_bind {
            flags.difference(MsFlags::MS_RDONLY)
        } else {
            flags
        };

        mount(Some(source), target, fstype, initial, data.as_deref())?;

        if readonly_bind {
            mount(
                None::<&Path>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }

        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        log::debug!("Unmounting {}", target.display());
        umount2(target, MntFlags::empty())?;
        Ok(())
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        let meta = fs::symlink_metadata(path)?;
        let Some(parent) = path.parent() else {
            return Ok(true);
        };

        if meta.dev() != fs::metadata(parent)?.dev() {
            return Ok(true);
        }

        // Bind mounts within one filesystem keep the device number
        let content = fs::read_to_string(MOUNTINFO)?;
        Ok(parse_mountinfo(&content)
            .iter()
            .any(|entry| entry.mount_point == path))
    }

    fn mount_refs(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let content = fs::read_to_string(MOUNTINFO)?;
        Ok(find_refs(&parse_mountinfo(&content), path))
    }

    fn list(&self) -> io::Result<Vec<MountPoint>> {
        let content = fs::read_to_string(MOUNTS)?;
        Ok(parse_mounts(&content))
    }
}

/// Translate mount(8)-style options into flags plus filesystem data
pub(crate) fn mount_flags(options: &[&str]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options {
        match *option {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" | "" => {}
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other),
        }
    }

    let data = (!data.is_empty()).then(|| data.join(","));
    (flags, data)
}

/// Parse `/proc/self/mounts` content
pub(crate) fn parse_mounts(content: &str) -> Vec<MountPoint> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next()?;

            Some(MountPoint {
                device: unescape(device),
                path: PathBuf::from(unescape(path)),
                fstype: fstype.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// One entry of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountInfo {
    /// major:minor of the backing device
    pub device: String,
    /// Directory of the filesystem that forms the root of this mount
    pub root: PathBuf,
    pub mount_point: PathBuf,
}

/// Parse `/proc/self/mountinfo` content
///
/// Format: id parent major:minor root mount_point options [optional...] - fstype source super_options
pub(crate) fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields.contains(&"-") {
                return None;
            }

            Some(MountInfo {
                device: fields[2].to_string(),
                root: PathBuf::from(unescape(fields[3])),
                mount_point: PathBuf::from(unescape(fields[4])),
            })
        })
        .collect()
}

/// Find every other mount point that shows the same directory as `path`
pub(crate) fn find_refs(entries: &[MountInfo], path: &Path) -> Vec<PathBuf> {
    // Mount holding `path`; on stacked mounts the last one is visible
    let Some(owner) = entries
        .iter()
        .filter(|entry| path.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.components().count())
    else {
        return Vec::new();
    };

    let root = match path.strip_prefix(&owner.mount_point) {
        Ok(rel) if !rel.as_os_str().is_empty() => owner.root.join(rel),
        _ => owner.root.clone(),
    };

    let mut refs: Vec<PathBuf> = Vec::new();
    for entry in entries {
        if entry.device == owner.device
            && entry.root == root
            && entry.mount_point != path
            && !refs.contains(&entry.mount_point)
        {
            refs.push(entry.mount_point.clone());
        }
    }
    refs
}

/// Decode the octal escapes (`\040` for space etc.) used by procfs
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
