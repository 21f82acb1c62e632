//! Process runner
//!
//! Executes external commands as children of the current process:
//! - `run` captures combined stdout/stderr
//! - `run_with_context` does the same, bounded by a cancellation context
//! - `run_streaming` hands both streams to line handlers as they are produced
//!
//! Nothing here mounts or switches roots. To run a command inside a jail,
//! wrap the call in `Jail::run_callback`.

pub mod context;
pub mod lines;

pub use context::Context;

use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, pipe2};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

/// How often the supervisor checks the context and the child
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Command execution
pub trait Runner {
    /// Run to completion and return combined stdout/stderr
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Like `run`, but the child is killed once `ctx` is done
    fn run_with_context(&self, ctx: &Context, command: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Run, delivering each stdout/stderr line to its handler as it arrives
    fn run_streaming(
        &self,
        ctx: &Context,
        on_stdout: &mut (dyn FnMut(&str) + Send),
        on_stderr: &mut (dyn FnMut(&str) + Send),
        command: &str,
        args: &[&str],
    ) -> Result<()>;
}

/// `Runner` spawning real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SysRunner;

impl Runner for SysRunner {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.run_with_context(&Context::background(), command, args)
    }

    fn run_with_context(&self, ctx: &Context, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let display = display_command(command, args);
        log::debug!("Running cmd: '{}'", display);

        // One pipe behind both streams keeps the child's interleaving
        let (reader, writer) = open_pipe(&display, "output")?;
        let stderr_writer = writer
            .try_clone()
            .map_err(|e| pipe_error(&display, "output", e))?;

        // The Command owns the parent's copies of the write ends; it must be
        // dropped before reading or EOF never arrives
        let spawned = {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr_writer);
            cmd.spawn()
        };
        let mut child = spawned.map_err(|e| Error::CommandStart {
            command: display.clone(),
            source: e,
        })?;

        let (done_tx, done_rx) = channel::unbounded();
        let (waited, drained) = crossbeam::scope(|s| {
            let drain = s.spawn(move |_| {
                let mut output = Vec::new();
                let read = File::from(reader).read_to_end(&mut output);
                let _ = done_tx.send(());
                read.map(|_| output)
            });

            let waited = supervise(&mut child, ctx, &done_rx, 1);
            (waited, drain.join())
        })
        .map_err(|_| reader_panicked(&display))?;

        let output = drained
            .map_err(|_| reader_panicked(&display))?
            .map_err(|e| pipe_error(&display, "output", e))?;
        let (status, cancelled) = waited.map_err(|e| Error::Wait {
            command: display.clone(),
            source: e,
        })?;

        check_exit(display, status, cancelled, output)
    }

    fn run_streaming(
        &self,
        ctx: &Context,
        on_stdout: &mut (dyn FnMut(&str) + Send),
        on_stderr: &mut (dyn FnMut(&str) + Send),
        command: &str,
        args: &[&str],
    ) -> Result<()> {
        let display = display_command(command, args);
        log::debug!("Running cmd: '{}'", display);

        // Both pipes exist before anything is started
        let (stdout_reader, stdout_writer) = open_pipe(&display, "stdout")?;
        let (stderr_reader, stderr_writer) = open_pipe(&display, "stderr")?;

        let spawned = {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(stdout_writer)
                .stderr(stderr_writer);
            cmd.spawn()
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                drop(stdout_reader);
                drop(stderr_reader);
                return Err(Error::CommandStart {
                    command: display,
                    source: e,
                });
            }
        };

        let (done_tx, done_rx) = channel::unbounded();
        let (waited, stdout_read, stderr_read) = crossbeam::scope(|s| {
            let stdout_done = done_tx.clone();
            let stdout_thread = s.spawn(move |_| {
                let read = lines::for_each_line(File::from(stdout_reader), on_stdout);
                let _ = stdout_done.send(());
                read
            });

            let stderr_thread = s.spawn(move |_| {
                let read = lines::for_each_line(File::from(stderr_reader), on_stderr);
                let _ = done_tx.send(());
                read
            });

            // Exit status is only collected after both readers hit EOF
            let waited = supervise(&mut child, ctx, &done_rx, 2);
            (waited, stdout_thread.join(), stderr_thread.join())
        })
        .map_err(|_| reader_panicked(&display))?;

        stdout_read
            .map_err(|_| reader_panicked(&display))?
            .map_err(|e| pipe_error(&display, "stdout", e))?;
        stderr_read
            .map_err(|_| reader_panicked(&display))?
            .map_err(|e| pipe_error(&display, "stderr", e))?;
        let (status, cancelled) = waited.map_err(|e| Error::Wait {
            command: display.clone(),
            source: e,
        })?;

        check_exit(display, status, cancelled, Vec::new()).map(drop)
    }
}

/// Wait for `pending` readers to report EOF and then for the child to exit,
/// killing the child once the context is done.
///
/// Returns the exit status and, if the child was killed, why.
fn supervise(
    child: &mut Child,
    ctx: &Context,
    done: &Receiver<()>,
    mut pending: usize,
) -> io::Result<(ExitStatus, Option<&'static str>)> {
    let mut cancelled = None;

    loop {
        if cancelled.is_none()
            && let Some(reason) = ctx.done_reason()
        {
            log::debug!("Killing process group {}: {}", child.id(), reason);
            kill_group(child);
            cancelled = Some(reason);
        }

        if pending > 0 {
            match done.recv_timeout(POLL_INTERVAL) {
                Ok(()) => pending -= 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => pending = 0,
            }
            continue;
        }

        if let Some(status) = child.try_wait()? {
            return Ok((status, cancelled));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the child and everything it started.
///
/// The child leads its own process group, so descendants holding the output
/// pipes die with it.
fn kill_group(child: &mut Child) {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        log::debug!("killpg {} failed: {}", group, e);
        // Fails harmlessly if the child already exited
        let _ = child.kill();
    }
}

fn check_exit(
    command: String,
    status: ExitStatus,
    cancelled: Option<&'static str>,
    output: Vec<u8>,
) -> Result<Vec<u8>> {
    if let Some(reason) = cancelled {
        log::debug!("Command '{}' was cancelled: {}", command, reason);
        return Err(Error::Cancelled { command, reason });
    }

    if !status.success() {
        log::debug!(
            "Command '{}' failed with {}, output: {}",
            command,
            status,
            String::from_utf8_lossy(&output)
        );
        return Err(Error::CommandExit {
            command,
            status,
            output,
        });
    }

    Ok(output)
}

fn open_pipe(command: &str, stream: &'static str) -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| pipe_error(command, stream, e.into()))
}

fn pipe_error(command: &str, stream: &'static str, source: io::Error) -> Error {
    Error::Pipe {
        command: command.to_string(),
        stream,
        source,
    }
}

fn reader_panicked(command: &str) -> Error {
    Error::Io(io::Error::other(format!(
        "output reader for '{}' panicked",
        command
    )))
}

fn display_command(command: &str, args: &[&str]) -> String {
    std::iter::once(command)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
