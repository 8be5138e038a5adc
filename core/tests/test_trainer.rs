//! Training loop and experiment driver integration tests.
//!
//! Everything runs on mod=5 with a tiny model so each test takes milliseconds.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use rand::SeedableRng;
use rand::rngs::StdRng;

use oocl_core::checkpoint::{checkpoint_path, load_checkpoint, CheckpointTag};
use oocl_core::config::{Curriculum, ExperimentConfig, LoopMode, Phase, TrainParams};
use oocl_core::experiment::{run_experiment, run_name};
use oocl_core::metrics::{MemorySink, NullSink};
use oocl_core::model::{Transformer, TransformerConfig};
use oocl_core::stream::{LinkageStream, SampleStream};
use oocl_core::table::{make_table_masks, Operation};
use oocl_core::trainer::{train_phase1, train_phase2, Phase1Streams, Phase2Streams, TrainContext, TrainOutcome};
use oocl_core::vocab::Vocab;
use oocl_core::TrainError;

const MOD: usize = 5;

struct Fixture {
    train_p1: SampleStream,
    valid_p1: SampleStream,
    train_p2: SampleStream,
    valid_p2: SampleStream,
    linkage: LinkageStream,
}

impl Fixture {
    fn new(batch: usize) -> Self {
        let vocab = Vocab::new(MOD).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let s1 = make_table_masks(MOD, Operation::Sum, 0.2, &mut rng).unwrap();
        let s2 = make_table_masks(MOD, Operation::Sum, 0.2, &mut rng).unwrap();
        let alias = s2.coords.offset(MOD);
        Fixture {
            train_p1: SampleStream::seeded(batch, &s1.coords, &s1.train, vocab, 1, "train").unwrap(),
            valid_p1: SampleStream::seeded(batch, &s1.coords, &s1.valid, vocab, 2, "valid").unwrap(),
            train_p2: SampleStream::seeded(batch, &alias, &s2.train, vocab, 3, "train").unwrap(),
            valid_p2: SampleStream::seeded(batch, &alias, &s2.valid, vocab, 4, "valid").unwrap(),
            linkage: LinkageStream::seeded(batch, vocab, 5).unwrap(),
        }
    }

    fn phase1(&mut self) -> Phase1Streams<'_> {
        Phase1Streams { train: &mut self.train_p1, valid: &mut self.valid_p1 }
    }

    fn phase2(&mut self) -> Phase2Streams<'_> {
        Phase2Streams {
            train_p1: &mut self.train_p1,
            train_p2: &mut self.train_p2,
            valid_p1: &mut self.valid_p1,
            valid_p2: &mut self.valid_p2,
            linkage: &mut self.linkage,
        }
    }
}

fn tiny_model() -> Transformer {
    Transformer::new(TransformerConfig::test_config(2 * MOD + 4), 0).unwrap()
}

fn small_params(n_steps: usize, n_steps_epoch: usize) -> TrainParams {
    TrainParams {
        n_steps,
        batch_size: 4,
        lr: 1e-2,
        warm_up_steps: 0,
        save_every: None,
        early_stop_valid_loss: None,
        n_steps_epoch,
        ..TrainParams::default()
    }
}

fn context<'a>(
    name: &'a str,
    models_dir: &'a Path,
    sink: &'a mut MemorySink,
    cancel: &'a AtomicBool,
) -> TrainContext<'a> {
    TrainContext { model_name: name, ts_start: 1234, models_dir, sink, cancel }
}

// ── Loop cadence ───────────────────────────────────────────────────────

#[test_log::test]
fn test_phase2_eleven_steps_validates_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = small_params(11, 10);

    let outcome = {
        let mut ctx = context("run_phase2", dir.path(), &mut sink, &cancel);
        train_phase2(&mut model, fx.phase2(), &params, &mut ctx).unwrap()
    };
    assert_eq!(outcome, TrainOutcome::Completed { steps: 11 });
    assert_eq!(sink.steps(), vec![10]);

    let names: Vec<&str> = sink.records[0].values.keys().map(|k| k.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "learning_rate",
            "train/loss_binop_p1",
            "train/loss_binop_p2",
            "train/loss_linkages",
            "valid/acc_binop_p1",
            "valid/acc_binop_p2",
            "valid/loss_binop_p1",
            "valid/loss_binop_p2",
        ]
    );
    for (name, value) in &sink.records[0].values {
        assert!(value.is_finite(), "{name} = {value}");
    }
}

#[test]
fn test_phase1_metric_names_and_lr() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { warm_up_steps: 100, ..small_params(21, 10) };

    {
        let mut ctx = context("run_phase1", dir.path(), &mut sink, &cancel);
        train_phase1(&mut model, fx.phase1(), &params, &mut ctx).unwrap();
    }
    assert_eq!(sink.steps(), vec![10, 20]);
    let rec = &sink.records[0];
    assert_eq!(rec.values.len(), 3);
    assert!(rec.get("train/loss").is_some());
    assert!(rec.get("valid/loss").is_some());
    // after step 10 the schedule has advanced 11 times
    let lr = rec.get("learning_rate").unwrap();
    assert!((lr - 0.01 * 11.0 / 100.0).abs() < 1e-7, "lr={lr}");
}

#[test]
fn test_zero_weight_terms_still_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { k_p2: 0.0, k_ln: 0.0, ..small_params(3, 2) };

    {
        let mut ctx = context("run_phase2", dir.path(), &mut sink, &cancel);
        train_phase2(&mut model, fx.phase2(), &params, &mut ctx).unwrap();
    }
    let rec = &sink.records[0];
    assert!(rec.get("train/loss_binop_p2").unwrap() > 0.0);
    assert!(rec.get("train/loss_linkages").unwrap() > 0.0);
}

// ── Checkpoints ────────────────────────────────────────────────────────

#[test]
fn test_checkpoints_only_at_both_cadences() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { save_every: Some(10), ..small_params(26, 5) };

    {
        let mut ctx = context("ckpt_phase1", dir.path(), &mut sink, &cancel);
        train_phase1(&mut model, fx.phase1(), &params, &mut ctx).unwrap();
    }
    assert_eq!(sink.steps(), vec![5, 10, 15, 20, 25]);

    let mut files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["ckpt_phase1.1234.0000000010.json", "ckpt_phase1.1234.0000000020.json"]);

    let loaded = load_checkpoint(&dir.path().join(&files[1])).unwrap();
    assert_eq!(loaded.cfg, model.cfg);
}

#[test]
fn test_save_every_off_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    {
        let mut ctx = context("none_phase1", dir.path(), &mut sink, &cancel);
        train_phase1(&mut model, fx.phase1(), &small_params(21, 10), &mut ctx).unwrap();
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// ── Early stop ─────────────────────────────────────────────────────────

#[test]
fn test_early_stop_below_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { early_stop_valid_loss: Some(1e9), ..small_params(50, 5) };

    let outcome = {
        let mut ctx = context("es_phase1", dir.path(), &mut sink, &cancel);
        train_phase1(&mut model, fx.phase1(), &params, &mut ctx).unwrap()
    };
    match outcome {
        TrainOutcome::EarlyStop { step, valid_loss } => {
            assert_eq!(step, 5);
            assert!(valid_loss < 1e9);
        }
        other => panic!("expected early stop, got {other:?}"),
    }
    assert_eq!(sink.steps(), vec![5]);
}

#[test]
fn test_no_early_stop_at_zero_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { early_stop_valid_loss: Some(0.0), ..small_params(12, 5) };

    let outcome = {
        let mut ctx = context("es_phase1", dir.path(), &mut sink, &cancel);
        train_phase1(&mut model, fx.phase1(), &params, &mut ctx).unwrap()
    };
    assert_eq!(outcome, TrainOutcome::Completed { steps: 12 });
}

#[test]
fn test_phase2_never_early_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { early_stop_valid_loss: Some(1e9), ..small_params(12, 5) };

    let outcome = {
        let mut ctx = context("es_phase2", dir.path(), &mut sink, &cancel);
        train_phase2(&mut model, fx.phase2(), &params, &mut ctx).unwrap()
    };
    assert_eq!(outcome, TrainOutcome::Completed { steps: 12 });
}

// ── Interruption ───────────────────────────────────────────────────────

#[test]
fn test_cancel_flag_interrupts_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(4);
    let mut model = tiny_model();
    let before = model.params.clone();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(true);

    let err = {
        let mut ctx = context("int_phase2", dir.path(), &mut sink, &cancel);
        train_phase2(&mut model, fx.phase2(), &small_params(10, 5), &mut ctx).unwrap_err()
    };
    assert!(matches!(err, TrainError::Interrupted { step: 0 }));
    assert_eq!(model.params, before, "no update may happen after cancellation");
}

// ── Training makes progress ────────────────────────────────────────────

#[test]
fn test_phase1_loss_decreases() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(16);
    let mut model = tiny_model();
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);
    let params = TrainParams { batch_size: 16, ..small_params(201, 20) };

    {
        let mut ctx = context("fit_phase1", dir.path(), &mut sink, &cancel);
        train_phase1(&mut model, fx.phase1(), &params, &mut ctx).unwrap();
    }
    let first = sink.records.first().unwrap().get("train/loss").unwrap();
    let last = sink.records.last().unwrap().get("train/loss").unwrap();
    assert!(last < first, "train loss did not fall: {first} -> {last}");
}

// ── Experiment driver ──────────────────────────────────────────────────

fn tiny_experiment(models_dir: &Path, mode: LoopMode) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.data.modulus = MOD;
    config.data.operation = Operation::Sum;
    config.train = TrainParams { early_stop_valid_loss: Some(1e-5), ..small_params(6, 3) };
    config.model = TransformerConfig::test_config(0);
    config.curricula = vec![Curriculum::new(0.2, 0.2, 1.0, 1.0, 1.0)];
    config.mode = mode;
    config.seed = Some(42);
    config.models_dir = models_dir.to_path_buf();
    config
}

#[test_log::test]
fn test_experiment_runs_and_saves_final_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_experiment(dir.path(), LoopMode::Phase1ThenPhase2);
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(false);

    let summaries = run_experiment(&config, &mut sink, &cancel).unwrap();
    assert_eq!(summaries.len(), 1);
    let s = &summaries[0];
    assert_eq!(s.name, "oocl_sum_5_0.2_0.2_1.0_1.0_1.0");
    assert_eq!(s.outcomes.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![Phase::One, Phase::Two]);
    assert_eq!(s.final_checkpoint, checkpoint_path(dir.path(), &s.name, s.ts_start, CheckpointTag::Final));
    assert!(s.final_checkpoint.exists());
    assert_eq!(load_checkpoint(&s.final_checkpoint).unwrap().cfg.d_vocab, 2 * MOD + 4);

    assert_eq!(sink.runs.len(), 1);
    assert_eq!(sink.runs[0].name, s.name);
    assert_eq!(sink.runs[0].config["mod"], MOD);
    assert_eq!(sink.finished, 1);
    // phase 1 validates at 3, phase 2 at 3
    assert_eq!(sink.steps(), vec![3, 3]);
}

#[test]
fn test_experiment_repetitions_and_curricula() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_experiment(dir.path(), LoopMode::Phase2);
    config.train.n_repetitions = 2;
    config.curricula = vec![
        Curriculum::new(0.2, 0.2, 1.0, 0.0, 0.0),
        Curriculum::new(0.2, 0.2, 1.0, 1.0, 0.0),
    ];
    let cancel = AtomicBool::new(false);
    let summaries = run_experiment(&config, &mut NullSink, &cancel).unwrap();
    let names: Vec<String> = summaries.iter().map(|s| s.name.clone()).collect();
    let expected: Vec<String> = [0, 1, 0, 1].iter().map(|&i| run_name(&config, &config.curricula[i])).collect();
    assert_eq!(names, expected);
}

#[test]
fn test_seeded_experiment_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_experiment(dir.path(), LoopMode::Phase2);
    let cancel = AtomicBool::new(false);
    let mut a = MemorySink::new();
    let mut b = MemorySink::new();
    run_experiment(&config, &mut a, &cancel).unwrap();
    run_experiment(&config, &mut b, &cancel).unwrap();
    assert_eq!(a.records, b.records);
}

#[test]
fn test_interrupted_experiment_saves_emergency_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_experiment(dir.path(), LoopMode::Phase2);
    let mut sink = MemorySink::new();
    let cancel = AtomicBool::new(true);

    let err = run_experiment(&config, &mut sink, &cancel).unwrap_err();
    assert!(err.is_interrupted());
    assert!(dir.path().join("phase2_interrupted.json").exists());
    assert_eq!(sink.runs.len(), 1, "run was opened");
    assert_eq!(sink.finished, 0, "interrupted run must stay unfinished");
}

#[test]
fn test_invalid_config_rejected_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_experiment(dir.path(), LoopMode::Phase2);
    config.train.batch_size = 0;
    let mut sink = MemorySink::new();
    let err = run_experiment(&config, &mut sink, &AtomicBool::new(false)).unwrap_err();
    assert!(matches!(err, TrainError::Config(_)));
    assert!(sink.runs.is_empty());
}

#[test]
fn test_degenerate_mask_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_experiment(dir.path(), LoopMode::Phase2);
    config.curricula = vec![Curriculum::new(1.0, 0.2, 1.0, 1.0, 1.0)];
    let err = run_experiment(&config, &mut NullSink, &AtomicBool::new(false)).unwrap_err();
    assert!(matches!(err, TrainError::Config(oocl_core::ConfigError::DegenerateMask(_))));
}
