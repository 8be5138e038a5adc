//! Curriculum sweep: one fresh model and one metrics run per curriculum entry.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde_json::{Map, Value};

use crate::checkpoint::{checkpoint_path, save_checkpoint, CheckpointTag};
use crate::config::{Curriculum, ExperimentConfig, Phase, TrainParams};
use crate::error::{MetricsError, TrainError};
use crate::metrics::{MetricsSink, RunInfo};
use crate::model::Transformer;
use crate::stream::{LinkageStream, SampleStream};
use crate::table::make_table_masks;
use crate::trainer::{train_phase1, train_phase2, Phase1Streams, Phase2Streams, TrainContext, TrainOutcome};

/// Result of one curriculum entry.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub name: String,
    pub ts_start: u64,
    pub outcomes: Vec<(Phase, TrainOutcome)>,
    pub final_checkpoint: PathBuf,
}

/// Round half away from zero to `digits` places and print with at least one decimal.
fn fmt_rounded(x: f64, digits: i32) -> String {
    let scale = 10f64.powi(digits);
    format!("{:?}", (x * scale).round() / scale)
}

/// `oocl_<op>_<mod>_<f1>_<f2>_<k_p1>_<k_p2>_<k_ln>`
pub fn run_name(config: &ExperimentConfig, curriculum: &Curriculum) -> String {
    format!(
        "oocl_{}_{}_{}_{}_{}_{}_{}",
        config.data.operation,
        config.data.modulus,
        fmt_rounded(curriculum.frac_held_out_phase1, 2),
        fmt_rounded(curriculum.frac_held_out_phase2, 2),
        fmt_rounded(curriculum.k_p1 as f64, 1),
        fmt_rounded(curriculum.k_p2 as f64, 1),
        fmt_rounded(curriculum.k_ln as f64, 1),
    )
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Flat run metadata: timestamp, fractions, then data, training and model fields.
fn run_metadata(
    config: &ExperimentConfig,
    curriculum: &Curriculum,
    params: &TrainParams,
    ts_start: u64,
) -> Result<Value, serde_json::Error> {
    let mut meta = Map::new();
    meta.insert("ts_start".into(), Value::from(ts_start));
    meta.insert("frac1".into(), Value::from(curriculum.frac_held_out_phase1));
    meta.insert("frac2".into(), Value::from(curriculum.frac_held_out_phase2));
    meta.insert("mode".into(), Value::from(config.mode.to_string()));
    let model = config
        .transformer_config()
        .map_err(<serde_json::Error as serde::ser::Error>::custom)?;
    for section in [
        serde_json::to_value(&config.data)?,
        serde_json::to_value(params)?,
        serde_json::to_value(&model)?,
    ] {
        if let Value::Object(fields) = section {
            meta.extend(fields);
        }
    }
    Ok(Value::Object(meta))
}

/// Run the whole sweep. Stops at the first error; an interruption writes
/// `phase{1|2}_interrupted.json` before returning.
pub fn run_experiment(
    config: &ExperimentConfig,
    sink: &mut dyn MetricsSink,
    cancel: &AtomicBool,
) -> Result<Vec<RunSummary>, TrainError> {
    config.validate()?;
    let mut master = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut summaries = Vec::new();
    for repetition in 0..config.train.n_repetitions {
        for curriculum in &config.curricula {
            log::debug!("repetition {repetition}: {curriculum:?}");
            summaries.push(run_curriculum(config, curriculum, &mut master, sink, cancel)?);
        }
    }
    Ok(summaries)
}

fn run_curriculum(
    config: &ExperimentConfig,
    curriculum: &Curriculum,
    master: &mut StdRng,
    sink: &mut dyn MetricsSink,
    cancel: &AtomicBool,
) -> Result<RunSummary, TrainError> {
    let m = config.data.modulus;
    let op = config.data.operation;
    let vocab = config.data.vocab()?;
    let params = config.train.with_weights(curriculum);
    let bs = params.batch_size;

    let split1 = make_table_masks(m, op, curriculum.frac_held_out_phase1, master)?;
    let split2 = make_table_masks(m, op, curriculum.frac_held_out_phase2, master)?;
    log::info!(
        "dataset has {} training examples and {} validation examples.",
        split1.train.count(),
        split1.valid.count()
    );

    let mut model = Transformer::new(config.transformer_config()?, master.random())?;
    let name = run_name(config, curriculum);
    log::info!("model / run named: {name} ({} parameters)", model.params.num_params());

    let alias_coords = split2.coords.offset(m);
    let mut train_p1 = SampleStream::seeded(bs, &split1.coords, &split1.train, vocab, master.random(), "phase-1 train")?;
    let mut valid_p1 = SampleStream::seeded(bs, &split1.coords, &split1.valid, vocab, master.random(), "phase-1 valid")?;
    let mut train_p2 = SampleStream::seeded(bs, &alias_coords, &split2.train, vocab, master.random(), "phase-2 train")?;
    let mut valid_p2 = SampleStream::seeded(bs, &alias_coords, &split2.valid, vocab, master.random(), "phase-2 valid")?;
    let mut linkage = LinkageStream::seeded(bs, vocab, master.random())?;

    let ts_start = unix_seconds();
    let started = Instant::now();
    let meta = run_metadata(config, curriculum, &params, ts_start).map_err(MetricsError::from)?;
    sink.start_run(&RunInfo { name: name.clone(), ts_start, config: meta })?;

    let mut outcomes = Vec::new();
    for &phase in config.mode.phases() {
        let model_name = format!("{name}_{phase}");
        let mut ctx = TrainContext {
            model_name: &model_name,
            ts_start,
            models_dir: &config.models_dir,
            sink: &mut *sink,
            cancel,
        };
        let result = match phase {
            Phase::One => train_phase1(
                &mut model,
                Phase1Streams { train: &mut train_p1, valid: &mut valid_p1 },
                &params,
                &mut ctx,
            ),
            Phase::Two => train_phase2(
                &mut model,
                Phase2Streams {
                    train_p1: &mut train_p1,
                    train_p2: &mut train_p2,
                    valid_p1: &mut valid_p1,
                    valid_p2: &mut valid_p2,
                    linkage: &mut linkage,
                },
                &params,
                &mut ctx,
            ),
        };
        match result {
            Ok(outcome) => outcomes.push((phase, outcome)),
            Err(err) if err.is_interrupted() => {
                // The metrics run stays open: an unfinished run marks the interruption.
                let path = checkpoint_path(&config.models_dir, &name, ts_start, CheckpointTag::Interrupted(phase));
                match save_checkpoint(&path, &model) {
                    Ok(()) => log::warn!("saved interrupted model to {}", path.display()),
                    Err(save_err) => log::error!("could not save interrupted model: {save_err}"),
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        }
    }

    let minutes = started.elapsed().as_secs() / 60;
    log::info!("training n_layers={} took {minutes} minutes", model.cfg.n_layers);
    let final_checkpoint = checkpoint_path(&config.models_dir, &name, ts_start, CheckpointTag::Final);
    log::info!("saving model to {}", final_checkpoint.display());
    save_checkpoint(&final_checkpoint, &model)?;
    sink.finish()?;

    Ok(RunSummary { name, ts_start, outcomes, final_checkpoint })
}
