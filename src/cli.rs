/// Command line entry point: argument parsing, logging, startup checks.
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{self, Settings};
use crate::gate::RequestGate;
use crate::paths::Paths;
use crate::runner::Runner;
use crate::server;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML settings file
    #[arg(long, default_value = "sandbox.yaml")]
    config: PathBuf,
    /// Address to accept submissions on
    #[arg(long, default_value = "127.0.0.1:8700")]
    listen: String,
    /// Install directory; the work area and the admission lock live here
    #[arg(long, default_value = ".")]
    install_dir: PathBuf,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let settings = config::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    init_logging(&settings)?;

    let install_dir = fs::canonicalize(&cli.install_dir)
        .with_context(|| format!("resolving install dir {}", cli.install_dir.display()))?;
    let paths = Paths::new(&settings.sandbox_files_root, &install_dir);
    paths
        .verify_artifacts()
        .context("sandbox artifacts missing; cannot start")?;

    log::info!(
        "sandbox root {}, work dir {}, timeout {}s, output cap {} bytes",
        settings.sandbox_files_root.display(),
        paths.work_dir.display(),
        settings.timeout,
        settings.max_output_size
    );

    let runner = Runner::new(settings, paths.clone()).context("preparing work directory")?;
    let gate = RequestGate::new(runner, paths.lock_file.clone());
    server::serve(&cli.listen, gate).map_err(Into::into)
}

fn init_logging(settings: &Settings) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = settings.debug_log_file.as_deref() {
        builder.target(env_logger::Target::Pipe(Box::new(open_debug_log(path)?)));
    }
    // try_init: tests may install a logger of their own first.
    let _ = builder.try_init();
    Ok(())
}

fn open_debug_log(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening debug log {}", path.display()))
}
