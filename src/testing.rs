//! In-memory capabilities for exercising the jail without privileges
//!
//! Every side-effecting call is recorded in a journal so tests can assert on
//! ordering. Failures are injected per path.

use crate::error::{Error, Result};
use crate::runner::{Context, Runner};
use crate::sys::{
    Capabilities, FileKind, Filesystem, MountPoint, Mounter, RootHandle, RootSwitch,
};
use nix::errno::Errno;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::rc::Rc;

#[derive(Debug)]
struct MockState {
    journal: Vec<String>,
    dirs: BTreeSet<PathBuf>,
    files: BTreeSet<PathBuf>,
    mounted: Vec<PathBuf>,
    cwd: PathBuf,
    fail_mount: BTreeSet<PathBuf>,
    fail_unmount: BTreeSet<PathBuf>,
    fail_remove: BTreeSet<PathBuf>,
    fail_cwd: bool,
    fail_chroot: bool,
    fail_fchdir: bool,
    output: Vec<u8>,
    fail_command: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            journal: Vec::new(),
            dirs: BTreeSet::from([PathBuf::from("/")]),
            files: BTreeSet::new(),
            mounted: Vec::new(),
            cwd: PathBuf::from("/work"),
            fail_mount: BTreeSet::new(),
            fail_unmount: BTreeSet::new(),
            fail_remove: BTreeSet::new(),
            fail_cwd: false,
            fail_chroot: false,
            fail_fchdir: false,
            output: Vec::new(),
            fail_command: false,
        }
    }
}

/// Shared fake system; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct MockSystem(Rc<RefCell<MockState>>);

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dirs(self, dirs: &[&str]) -> Self {
        {
            let mut state = self.0.borrow_mut();
            for dir in dirs {
                add_dir(&mut state.dirs, Path::new(dir));
            }
        }
        self
    }

    pub fn with_files(self, files: &[&str]) -> Self {
        {
            let mut state = self.0.borrow_mut();
            for file in files {
                let path = Path::new(file);
                if let Some(parent) = path.parent() {
                    add_dir(&mut state.dirs, parent);
                }
                state.files.insert(path.to_path_buf());
            }
        }
        self
    }

    /// Canned combined output for every command
    pub fn with_output(self, output: &str) -> Self {
        self.0.borrow_mut().output = output.as_bytes().to_vec();
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            mounter: Box::new(self.clone()),
            root: Box::new(self.clone()),
            fs: Box::new(self.clone()),
            runner: Box::new(self.clone()),
        }
    }

    pub fn fail_mount(&self, target: &str) {
        self.0.borrow_mut().fail_mount.insert(PathBuf::from(target));
    }

    pub fn fail_unmount(&self, target: &str) {
        self.0.borrow_mut().fail_unmount.insert(PathBuf::from(target));
    }

    pub fn fail_remove(&self, path: &str) {
        self.0.borrow_mut().fail_remove.insert(PathBuf::from(path));
    }

    pub fn fail_current_dir(&self) {
        self.0.borrow_mut().fail_cwd = true;
    }

    pub fn fail_chroot(&self) {
        self.0.borrow_mut().fail_chroot = true;
    }

    pub fn fail_fchdir(&self) {
        self.0.borrow_mut().fail_fchdir = true;
    }

    pub fn fail_command(&self) {
        self.0.borrow_mut().fail_command = true;
    }

    pub fn set_cwd(&self, cwd: &str) {
        self.0.borrow_mut().cwd = PathBuf::from(cwd);
    }

    pub fn clear_failures(&self) {
        let mut state = self.0.borrow_mut();
        state.fail_mount.clear();
        state.fail_unmount.clear();
        state.fail_remove.clear();
        state.fail_cwd = false;
        state.fail_chroot = false;
        state.fail_fchdir = false;
        state.fail_command = false;
    }

    pub fn journal(&self) -> Vec<String> {
        self.0.borrow().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.0.borrow_mut().journal.clear();
    }

    /// Journal entries starting with `prefix`
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.0
            .borrow()
            .journal
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Targets currently mounted, in mount order
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.0.borrow().mounted.clone()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.0.borrow().dirs.contains(Path::new(path))
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.0.borrow().files.contains(Path::new(path))
    }

    fn record(&self, entry: String) {
        self.0.borrow_mut().journal.push(entry);
    }
}

fn add_dir(dirs: &mut BTreeSet<PathBuf>, path: &Path) {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        dirs.insert(ancestor.to_path_buf());
    }
}

fn injected(what: &str, path: &Path) -> io::Error {
    io::Error::other(format!("injected {} failure on {}", what, path.display()))
}

impl Mounter for MockSystem {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        _fstype: Option<&str>,
        _options: &[&str],
    ) -> io::Result<()> {
        self.record(format!("mount {} {}", source.display(), target.display()));
        let mut state = self.0.borrow_mut();
        if state.fail_mount.contains(target) {
            return Err(injected("mount", target));
        }
        state.mounted.push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        self.record(format!("unmount {}", target.display()));
        let mut state = self.0.borrow_mut();
        if state.fail_unmount.contains(target) {
            return Err(io::Error::from(Errno::EBUSY));
        }
        match state.mounted.iter().rposition(|m| m == target) {
            Some(idx) => {
                state.mounted.remove(idx);
                Ok(())
            }
            None => Err(io::Error::from(Errno::EINVAL)),
        }
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        Ok(self.0.borrow().mounted.iter().any(|m| m == path))
    }

    fn mount_refs(&self, _path: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn list(&self) -> io::Result<Vec<MountPoint>> {
        Ok(self
            .0
            .borrow()
            .mounted
            .iter()
            .map(|path| MountPoint {
                device: "mock".to_string(),
                path: path.clone(),
                fstype: "none".to_string(),
                options: vec!["bind".to_string()],
            })
            .collect())
    }
}

impl RootSwitch for MockSystem {
    fn current_dir(&self) -> io::Result<PathBuf> {
        let state = self.0.borrow();
        if state.fail_cwd {
            return Err(io::Error::from(Errno::ENOENT));
        }
        Ok(state.cwd.clone())
    }

    fn open_root(&self) -> io::Result<RootHandle> {
        self.record("open_root".to_string());
        Ok(RootHandle::detached())
    }

    fn chroot(&self, path: &Path) -> io::Result<()> {
        self.record(format!("chroot {}", path.display()));
        if self.0.borrow().fail_chroot {
            return Err(io::Error::from(Errno::EPERM));
        }
        Ok(())
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        self.record(format!("chdir {}", path.display()));
        self.0.borrow_mut().cwd = path.to_path_buf();
        Ok(())
    }

    fn fchdir(&self, _handle: &RootHandle) -> io::Result<()> {
        self.record("fchdir".to_string());
        if self.0.borrow().fail_fchdir {
            return Err(io::Error::from(Errno::EBADF));
        }
        Ok(())
    }
}

impl Filesystem for MockSystem {
    fn stat(&self, path: &Path) -> io::Result<FileKind> {
        let state = self.0.borrow();
        if state.dirs.contains(path) {
            Ok(FileKind::Directory)
        } else if state.files.contains(path) {
            Ok(FileKind::File)
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        let state = self.0.borrow();
        Ok(state.dirs.contains(path) || state.files.contains(path))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.record(format!("mkdir {}", path.display()));
        add_dir(&mut self.0.borrow_mut().dirs, path);
        Ok(())
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        self.record(format!("create {}", path.display()));
        self.0.borrow_mut().files.insert(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.record(format!("remove {}", path.display()));
        let mut state = self.0.borrow_mut();
        if state.fail_remove.contains(path) {
            return Err(injected("remove", path));
        }
        if state.files.remove(path) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }
}

impl MockSystem {
    fn command_result(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.record(format!("run {}", line));

        let state = self.0.borrow();
        if state.fail_command {
            return Err(Error::CommandExit {
                command: line,
                status: ExitStatus::from_raw(1 << 8),
                output: state.output.clone(),
            });
        }
        Ok(state.output.clone())
    }
}

impl Runner for MockSystem {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.command_result(command, args)
    }

    fn run_with_context(&self, ctx: &Context, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        if let Some(reason) = ctx.done_reason() {
            return Err(Error::Cancelled {
                command: command.to_string(),
                reason,
            });
        }
        self.command_result(command, args)
    }

    fn run_streaming(
        &self,
        ctx: &Context,
        on_stdout: &mut (dyn FnMut(&str) + Send),
        _on_stderr: &mut (dyn FnMut(&str) + Send),
        command: &str,
        args: &[&str],
    ) -> Result<()> {
        let output = self.run_with_context(ctx, command, args)?;
        for line in String::from_utf8_lossy(&output).lines() {
            on_stdout(line);
        }
        Ok(())
    }
}
