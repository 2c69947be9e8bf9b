use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use rhea_lab_orchestrator::checkpoints::CheckpointStore;
use rhea_lab_orchestrator::config::ConfigDoc;
use rhea_lab_orchestrator::environment::Environment;
use rhea_lab_orchestrator::executor::{ResilientExecutor, StdoutSink};
use rhea_lab_orchestrator::runner::StageRunner;
use rhea_lab_orchestrator::session::SshSessionFactory;
use rhea_lab_orchestrator::{Result, backend, config, resolver};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the fully-merged TOML
    Resolve {
        /// Path to a lab definition TOML
        lab: PathBuf,
        /// Optional overlay merged over the lab definition
        #[arg(long)]
        overlay: Option<PathBuf>,
    },
    /// Print the checkpoint candidate order for a stage
    Candidates {
        lab: PathBuf,
        /// Stage name to resolve for
        stage: String,
    },
    /// List declared stages with installed flag and checkpoint presence
    Status {
        lab: PathBuf,
    },
    /// Provision a stage: resolve, revert, execute its batch, checkpoint
    Install {
        lab: PathBuf,
        /// Stage name to install
        stage: String,
        /// Seconds to wait for nodes to become reachable
        #[arg(long, default_value_t = 600)]
        start_timeout: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Resolve { lab, overlay } => cmd_resolve(&lab, overlay.as_deref()),
        Command::Candidates { lab, stage } => cmd_candidates(&lab, &stage),
        Command::Status { lab } => cmd_status(&lab),
        Command::Install {
            lab,
            stage,
            start_timeout,
        } => cmd_install(&lab, &stage, start_timeout),
    }
}

fn load(lab: &std::path::Path, overlay: Option<&std::path::Path>) -> Result<ConfigDoc> {
    match overlay {
        Some(overlay) => config::load_with_overlay(lab, overlay),
        None => config::load(lab),
    }
}

fn cmd_resolve(lab: &std::path::Path, overlay: Option<&std::path::Path>) -> Result<()> {
    let doc = load(lab, overlay)?;
    print!("{}", doc.to_toml_string());
    Ok(())
}

fn cmd_candidates(lab: &std::path::Path, stage: &str) -> Result<()> {
    let doc = load(lab, None)?;
    let stages = resolver::load_stages(&doc)?;
    for (i, cand) in resolver::candidates(&stages, stage)?.iter().enumerate() {
        println!("{:>2}. {cand}", i + 1);
    }
    println!("  root: {}", resolver::root_checkpoint(&doc));
    Ok(())
}

fn cmd_status(lab: &std::path::Path) -> Result<()> {
    let doc = load(lab, None)?;
    let stages = resolver::load_stages(&doc)?;
    let b = backend::from_config(&doc)?;
    for stage in &stages {
        let snapshot = b.has(&stage.name).unwrap_or(false);
        let descriptor = b.has_config(&stage.name).unwrap_or(false);
        println!(
            "{:<24} installed={:<5} snapshot={:<5} descriptor={}",
            stage.name, stage.installed, snapshot, descriptor
        );
    }
    Ok(())
}

fn cmd_install(lab: &std::path::Path, stage: &str, start_timeout: u64) -> Result<()> {
    let doc = load(lab, None)?;
    let sessions = Box::new(SshSessionFactory::from_config(&doc)?);
    let mut env = Environment::new(doc, sessions);
    env.bind_backend(backend::from_config(&env.config)?);

    env.backend_mut()?
        .start("*", Duration::from_secs(start_timeout))?;
    env.discover("*")?;

    let store = CheckpointStore::from_config(&env.config)?;
    let executor = ResilientExecutor::new(Arc::new(StdoutSink::default()));
    let runner = StageRunner::new(store, executor);
    let handle = runner.install(&mut env, stage)?;
    println!(
        "stage '{}' {} (resumed from: {})",
        handle.name,
        handle.phase,
        handle.resumed_from.as_deref().unwrap_or("<bootstrap>")
    );
    Ok(())
}
