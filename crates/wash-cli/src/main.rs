//! wash CLI entry point.
//!
//! Usage:
//!   wash mount <dir> [--plugin NAME=SCRIPT]...   # Mount and serve
//!   wash history [ID] [-f]                       # Enumerate or read journals
//!   wash --help
//!
//! `mount` projects every configured plugin under `<dir>` via FUSE and
//! starts the HTTP control surface. Plugins come from the config file
//! (`~/.config/wash/wash.toml`) plus any `--plugin` flags.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wash_kernel::{
    ExternalEntry, Journal, PluginExecutable, Registry, SpawnLimits, WashConfig,
};

/// Exit code reserved for "could not attach the FUSE session".
const EXIT_NO_FUSE: u8 = 255;

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!("wash {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }

        Some("mount") => run_mount(&args[2..]),

        Some("history") => run_history(&args[2..]),

        Some(other) => {
            bail!("unknown command {:?}; see wash --help", other);
        }
    }
}

fn run_mount(args: &[String]) -> Result<ExitCode> {
    let mut mountpoint: Option<PathBuf> = None;
    let mut addr_override: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut cli_plugins: Vec<(String, PathBuf)> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--plugin" => {
                let spec = iter.next().context("--plugin requires NAME=SCRIPT")?;
                let (name, script) = spec
                    .split_once('=')
                    .with_context(|| format!("--plugin {:?} is not NAME=SCRIPT", spec))?;
                cli_plugins.push((name.to_string(), PathBuf::from(script)));
            }
            "--addr" => {
                addr_override = Some(iter.next().context("--addr requires HOST:PORT")?.clone());
            }
            "--config" => {
                config_path = Some(PathBuf::from(
                    iter.next().context("--config requires a path")?,
                ));
            }
            other if mountpoint.is_none() && !other.starts_with('-') => {
                mountpoint = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument {:?}", other),
        }
    }
    let mountpoint = mountpoint.context("mount requires a mountpoint directory")?;

    let config = match &config_path {
        Some(path) => WashConfig::load_from(path)?,
        None => WashConfig::load()?,
    };
    let addr = addr_override.unwrap_or_else(|| config.addr.clone());
    let addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", addr))?;

    let mut plugins: Vec<(String, PathBuf)> = config
        .plugins
        .iter()
        .map(|p| (p.name.clone(), p.script.clone()))
        .collect();
    plugins.extend(cli_plugins);
    if plugins.is_empty() {
        bail!("no plugins configured; pass --plugin NAME=SCRIPT or edit the config file");
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;

    let journal = Journal::open(wash_kernel::paths::activity_dir())
        .context("failed to open the activity journal")?
        .with_rotation(config.journal_max_size, config.journal_max_age());
    let limits = Arc::new(SpawnLimits::new(
        config.plugin_spawn_limit,
        config.termination_grace(),
    ));

    let mut registry = Registry::new(Arc::new(journal));
    for (name, script) in &plugins {
        tracing::info!("mounting plugin {} from {}", name, script.display());
        let script = Arc::new(PluginExecutable::new(script, limits.clone()));
        registry.mount(Arc::new(ExternalEntry::plugin_root(name, script)));
    }
    let registry = Arc::new(registry);

    let server = runtime
        .block_on(wash_server::WashServer::start(
            registry.clone(),
            addr,
            config.call_deadline(),
        ))
        .context("failed to start the control server")?;
    tracing::info!("control surface on http://{}", server.addr);

    let fuse_options = wash_fuse::WashFsOptions {
        attr_ttl: config.fuse_attr_ttl(),
        call_deadline: config.call_deadline(),
    };

    // mount() blocks this thread until the filesystem is unmounted.
    let mounted = wash_fuse::mount(
        registry,
        runtime.handle().clone(),
        &mountpoint,
        fuse_options,
    );
    runtime.block_on(server.shutdown());

    match mounted {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!(
                "wash: could not attach FUSE at {}: {}",
                mountpoint.display(),
                e
            );
            Ok(ExitCode::from(EXIT_NO_FUSE))
        }
    }
}

fn run_history(args: &[String]) -> Result<ExitCode> {
    let journal = Journal::open_default().context("failed to open the activity journal")?;
    let follow = args.iter().any(|a| a == "-f" || a == "--follow");
    let id = args.iter().find(|a| !a.starts_with('-'));

    match id {
        None if follow => bail!("-f requires a journal id"),
        None => {
            let mut infos = journal.list().context("failed to enumerate journals")?;
            if infos.is_empty() {
                println!("no activity recorded");
                return Ok(ExitCode::SUCCESS);
            }
            infos.sort_by(|a, b| b.started.cmp(&a.started));
            for info in infos {
                let started = info
                    .started
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:>8}B  {}", started, info.size, info.id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(id) => {
            let id = wash_kernel::JournalId::new(id);
            match journal.read(&id) {
                Ok(content) => {
                    print!("{}", content);
                    if follow {
                        follow_journal(&journal, &id, content.len() as u64)?;
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    eprintln!("wash: no journal named {}", id);
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Err(e).context("failed to read journal"),
            }
        }
    }
}

/// Poll the journal file and print appended records until interrupted.
fn follow_journal(journal: &Journal, id: &wash_kernel::JournalId, mut seen: u64) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let path = journal.path_for(id);
    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            // Rotated away; start over from the fresh file.
            Err(_) => continue,
        };
        if len < seen {
            seen = 0;
        }
        if len == seen {
            continue;
        }
        let mut file = std::fs::File::open(&path).context("failed to reopen journal")?;
        file.seek(SeekFrom::Start(seen))?;
        let mut tail = String::new();
        file.read_to_string(&mut tail)?;
        print!("{}", tail);
        std::io::stdout().flush().ok();
        seen = len;
    }
}

fn print_help() {
    println!(
        r#"wash - the wide-area shell

USAGE:
    wash mount <dir> [OPTIONS]     Mount plugins under <dir> and serve
    wash history [ID] [-f]         List journals, or print (and follow) one
    wash --version

MOUNT OPTIONS:
    --plugin NAME=SCRIPT    Mount an external plugin (repeatable)
    --addr HOST:PORT        Control server address (default 127.0.0.1:4444)
    --config PATH           Config file (default ~/.config/wash/wash.toml)

Set RUST_LOG=debug for verbose logging. Exit code 255 means the FUSE
session could not be attached (missing kernel support or privileges)."#
    );
}
