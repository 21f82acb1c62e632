//! Drydock - run commands inside a chroot jail
//!
//! Prepares the jail's bind mounts, runs one command with the process rooted
//! in it, and releases everything again.

use drydock::cli::{Cli, Commands};
use drydock::manifest::{self, DrydockConfig};
use drydock::sys::{Mounter, SysMounter};
use drydock::{Capabilities, CleanStack, Context, Error, Jail, Result};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    // Commands that don't require config
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = manifest::load_or_default(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Exec {
            root,
            binds,
            no_default_binds,
            timeout,
            stream,
            command,
        } => {
            let opts = ExecOptions {
                binds: binds.into_iter().collect(),
                no_default_binds,
                timeout: timeout.map(Duration::from_secs),
                stream,
            };
            exec(&config, &root, &opts, &command)
        }
        Commands::Mounts { path, json } => mounts(path.as_deref(), json),
        Commands::Completion { .. } => Ok(()),
    }
}

/// RUST_LOG wins, then --verbose, then the configured level
fn init_logging(config: &DrydockConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log.level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Exit with the command's own status when it ran and failed
fn exit_code(err: &Error) -> i32 {
    err.errors()
        .iter()
        .find_map(|e| match e {
            Error::CommandExit { status, .. } => status.code(),
            _ => None,
        })
        .unwrap_or(1)
}

struct ExecOptions {
    binds: BTreeMap<PathBuf, PathBuf>,
    no_default_binds: bool,
    timeout: Option<Duration>,
    stream: bool,
}

fn exec(config: &DrydockConfig, root: &Path, opts: &ExecOptions, command: &[String]) -> Result<()> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("no command given".to_string()))?;
    let args: Vec<&str> = rest.iter().map(String::as_str).collect();

    let defaults = if opts.no_default_binds {
        Vec::new()
    } else {
        config.jail.default_binds.clone()
    };
    let mut extra = config.jail.binds.clone();
    extra.extend(opts.binds.clone());

    let ctx = match opts.timeout.or_else(|| config.runner.timeout()) {
        Some(timeout) => Context::with_timeout(timeout),
        None => Context::background(),
    };
    let stream = opts.stream || config.runner.stream;

    let caps = Capabilities::system();
    let jail = RefCell::new(
        Jail::new(root, &caps)
            .with_default_binds(defaults)
            .with_extra_binds(extra),
    );

    jail.borrow_mut().prepare()?;
    log::info!(
        "Prepared {} with {} mounts",
        root.display(),
        jail.borrow().active_mounts().len()
    );

    let mut stack = CleanStack::new();
    stack.push(|| jail.borrow_mut().close());

    let result = {
        let mut jail = jail.borrow_mut();
        if stream {
            jail.run_callback(|| {
                caps.runner.run_streaming(
                    &ctx,
                    &mut |line: &str| println!("{}", line),
                    &mut |line: &str| eprintln!("{}", line),
                    program,
                    &args,
                )
            })
        } else {
            jail.run_with_context(&ctx, program, &args)
                .and_then(|output| Ok(io::stdout().write_all(&output)?))
        }
    };

    stack.cleanup(result)
}

fn mounts(path: Option<&Path>, json: bool) -> Result<()> {
    let mounter = SysMounter;

    let Some(path) = path else {
        let table = mounter.list()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&table)?);
        } else {
            for mount in &table {
                println!(
                    "{} on {} type {}",
                    mount.device,
                    mount.path.display(),
                    mount.fstype
                );
            }
        }
        return Ok(());
    };

    let mount_point = mounter.is_mount_point(path)?;
    let refs = mounter.mount_refs(path)?;

    if json {
        let report = serde_json::json!({
            "path": path,
            "mount_point": mount_point,
            "refs": refs,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: {}",
            path.display(),
            if mount_point { "mount point" } else { "not a mount point" }
        );
        for r in &refs {
            println!("  also mounted at {}", r.display());
        }
    }

    Ok(())
}
