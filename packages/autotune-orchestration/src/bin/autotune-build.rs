//! Autotune Build CLI
//!
//! # Usage
//!
//! ```bash
//! # Build a batch of candidates on 4 workers, 10 s per task
//! cargo run --bin autotune-build -- build --batch batch.json --workers 4 --timeout 10
//!
//! # Same, with settings from a YAML file
//! cargo run --bin autotune-build -- build --batch batch.json --config builder.yaml
//!
//! # Print the entry function signature of a program
//! cargo run --bin autotune-build -- arg-info --program module.json
//! ```
//!
//! `batch.json` is a JSON array of `{ "program": ..., "target": "llvm", "params": {...} }`.

use anyhow::Context;
use autotune_orchestration::{
    ArgInfo, BuildInput, Builder, BuilderSettings, IRModule, LocalBuilder,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autotune-build")]
#[command(about = "Autotune Build - compile candidate programs in isolated workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a batch of programs
    Build {
        /// JSON array of build inputs
        #[arg(short, long)]
        batch: PathBuf,

        /// Builder settings (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of worker processes (overrides the settings file)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Seconds allotted to each task (overrides the settings file)
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// Print the entry function signature of a program
    ArgInfo {
        /// Program module (JSON)
        #[arg(short, long)]
        program: PathBuf,
    },
}

/// One line of `build` output
#[derive(Serialize)]
struct ResultLine<'a> {
    index: usize,
    artifact_path: Option<&'a Path>,
    error_msg: Option<&'a str>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            batch,
            config,
            workers,
            timeout,
        } => run_build(batch, config, workers, timeout).await,
        Commands::ArgInfo { program } => {
            print_arg_info(&program)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_build(
    batch: PathBuf,
    config: Option<PathBuf>,
    workers: Option<usize>,
    timeout: Option<f64>,
) -> anyhow::Result<ExitCode> {
    let mut settings = match &config {
        Some(path) => BuilderSettings::from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => BuilderSettings::default(),
    };
    if workers.is_some() {
        settings.num_workers = workers;
    }
    if timeout.is_some() {
        settings.timeout_sec = timeout;
    }

    let content = std::fs::read_to_string(&batch)
        .with_context(|| format!("Failed to read batch {}", batch.display()))?;
    let inputs: Vec<BuildInput> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse batch {}", batch.display()))?;

    let builder = LocalBuilder::new(settings.into_config()?).await?;
    let results = builder.build(&inputs).await;
    builder.shutdown().await;

    let mut any_failed = false;
    for (index, result) in results.iter().enumerate() {
        any_failed |= !result.is_success();
        let line = ResultLine {
            index,
            artifact_path: result.artifact_path(),
            error_msg: result.error_msg(),
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    Ok(if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_arg_info(program: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(program)
        .with_context(|| format!("Failed to read program {}", program.display()))?;
    let module = IRModule::from_json_str(&content)?;
    let args = ArgInfo::from_entry_func(&module)?;
    println!("{}", serde_json::to_string(&args.as_json())?);
    Ok(())
}
