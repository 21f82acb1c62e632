//! Command-line interface for Drydock
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Component, PathBuf};

/// Drydock - run commands inside a chroot jail
#[derive(Parser)]
#[command(name = "drydock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (defaults to ./drydock.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a command inside a jail root
    Exec {
        /// Directory that becomes the new root
        root: PathBuf,

        /// Extra bind mount (HOST or HOST:JAIL, repeatable)
        #[arg(short, long = "bind", value_name = "HOST[:JAIL]", value_parser = parse_bind)]
        binds: Vec<(PathBuf, PathBuf)>,

        /// Skip the default /dev, /dev/pts, /proc and /sys binds
        #[arg(long)]
        no_default_binds: bool,

        /// Kill the command after this many seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Print output line by line as it is produced
        #[arg(long)]
        stream: bool,

        /// Command and arguments
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Show the mount table, or mount details for one path
    Mounts {
        /// Path to inspect
        path: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse `HOST[:JAIL]`; the jail path defaults to the host path
pub fn parse_bind(value: &str) -> Result<(PathBuf, PathBuf), String> {
    let (host, inside) = match value.split_once(':') {
        Some((host, inside)) => (host, inside),
        None => (value, value),
    };

    if host.is_empty() || inside.is_empty() {
        return Err(format!("invalid bind '{}', expected HOST[:JAIL]", value));
    }

    let host = PathBuf::from(host);
    if !host.is_absolute() {
        return Err(format!("bind source '{}' must be absolute", host.display()));
    }

    let inside = PathBuf::from(inside);
    if inside.components().any(|c| c == Component::ParentDir) {
        return Err(format!(
            "bind target '{}' must not contain '..'",
            inside.display()
        ));
    }

    Ok((host, inside))
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "drydock", &mut std::io::stdout());
    }
}
