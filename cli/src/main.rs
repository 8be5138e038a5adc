//! `oocl`: run the out-of-context learning curriculum sweep.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;

use oocl_core::metrics::JsonlSink;
use oocl_core::{run_experiment, ExperimentConfig, LoopMode, TrainError};

#[derive(Parser, Debug)]
#[command(name = "oocl", version, about = "Train transformers on aliased modular arithmetic")]
struct Args {
    /// JSON experiment config; omitted fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Loop mode: phase1, phase2 or phase1-then-phase2
    #[arg(long)]
    mode: Option<LoopMode>,

    /// Master seed for tables, streams and model init
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    models_dir: Option<PathBuf>,

    #[arg(long)]
    runs_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(dir) = &args.models_dir {
        config.models_dir = dir.clone();
    }
    if let Some(dir) = &args.runs_dir {
        config.runs_dir = dir.clone();
    }
    config.validate().context("invalid experiment config")?;
    Ok(config)
}

fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(&args)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .context("installing Ctrl-C handler")?;

    log::info!(
        "mode={} mod={} op={} models_dir={} runs_dir={}",
        config.mode,
        config.data.modulus,
        config.data.operation,
        config.models_dir.display(),
        config.runs_dir.display()
    );

    let mut sink = JsonlSink::new(config.runs_dir.clone());
    match run_experiment(&config, &mut sink, &cancel) {
        Ok(summaries) => {
            for s in &summaries {
                log::info!("{} finished: {:?} -> {}", s.name, s.outcomes, s.final_checkpoint.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(TrainError::Interrupted { step }) => {
            log::warn!("interrupted at step {step}");
            Ok(ExitCode::from(130))
        }
        Err(err) => Err(err).context("experiment failed"),
    }
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run(Args::parse())
}
