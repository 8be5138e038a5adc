//! Typed run configuration.
//!
//! Every record has serde defaults, so a JSON file only needs the fields it
//! overrides. `ExperimentConfig::validate` runs before any table or model is
//! built; nothing downstream re-checks these invariants.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::ConfigError;
use crate::model::TransformerConfig;
use crate::table::Operation;
use crate::vocab::Vocab;

// ── Data ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParams {
    #[serde(rename = "mod")]
    pub modulus: usize,
    /// Number of disjoint token groups (originals + aliases).
    pub n_groups: usize,
    pub operation: Operation,
}

impl Default for DataParams {
    fn default() -> Self {
        DataParams { modulus: 997, n_groups: 2, operation: Operation::SumOfSquares }
    }
}

impl DataParams {
    pub fn vocab(&self) -> Result<Vocab, ConfigError> {
        Vocab::new(self.modulus)
    }
}

// ── Training ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    pub n_steps: usize,
    /// How many times the whole curriculum sweep is repeated.
    pub n_repetitions: usize,
    pub batch_size: usize,
    pub lr: f32,
    pub wd: f32,
    pub betas: (f32, f32),
    pub max_grad_norm: Option<f32>,
    pub warm_up_steps: usize,
    /// Checkpoint cadence in steps; only honoured on validation steps.
    pub save_every: Option<usize>,
    /// Phase 1 stops once validation loss falls below this.
    pub early_stop_valid_loss: Option<f32>,
    /// Validate and log once every this many steps.
    pub n_steps_epoch: usize,
    pub k_p1: f32,
    pub k_p2: f32,
    pub k_ln: f32,
}

impl Default for TrainParams {
    fn default() -> Self {
        TrainParams {
            n_steps: 50_000,
            n_repetitions: 1,
            batch_size: 256,
            lr: 1.4e-3,
            wd: 0.1,
            betas: (0.9, 0.98),
            max_grad_norm: Some(1.0),
            warm_up_steps: 1000,
            save_every: Some(10_000),
            early_stop_valid_loss: Some(1e-5),
            n_steps_epoch: 100,
            k_p1: 1.0,
            k_p2: 1.0,
            k_ln: 1.0,
        }
    }
}

impl TrainParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.n_steps_epoch == 0 {
            return Err(ConfigError::ZeroValidationCadence);
        }
        if self.save_every == Some(0) {
            return Err(ConfigError::ZeroCheckpointCadence);
        }
        let bad = |name: &'static str, value: f32| ConfigError::InvalidHyperparameter {
            name,
            value: value as f64,
        };
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(bad("lr", self.lr));
        }
        if !(self.wd.is_finite() && self.wd >= 0.0) {
            return Err(bad("wd", self.wd));
        }
        for (name, beta) in [("beta1", self.betas.0), ("beta2", self.betas.1)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(bad(name, beta));
            }
        }
        if let Some(max) = self.max_grad_norm {
            if !(max.is_finite() && max > 0.0) {
                return Err(bad("max_grad_norm", max));
            }
        }
        for (name, k) in [("k_p1", self.k_p1), ("k_p2", self.k_p2), ("k_ln", self.k_ln)] {
            if !(k.is_finite() && k >= 0.0) {
                return Err(bad(name, k));
            }
        }
        Ok(())
    }

    /// Copy with the loss weights of `curriculum`.
    pub fn with_weights(&self, curriculum: &Curriculum) -> TrainParams {
        TrainParams {
            k_p1: curriculum.k_p1,
            k_p2: curriculum.k_p2,
            k_ln: curriculum.k_ln,
            ..self.clone()
        }
    }
}

// ── Curricula ──────────────────────────────────────────────────────────

/// One entry of the experiment sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Curriculum {
    pub frac_held_out_phase1: f64,
    pub frac_held_out_phase2: f64,
    pub k_p1: f32,
    pub k_p2: f32,
    pub k_ln: f32,
}

impl Curriculum {
    pub fn new(f1: f64, f2: f64, k_p1: f32, k_p2: f32, k_ln: f32) -> Self {
        Curriculum { frac_held_out_phase1: f1, frac_held_out_phase2: f2, k_p1, k_p2, k_ln }
    }
}

/// Phase-1 objective only, then adding aliases, then adding linkages.
pub fn default_curricula() -> Vec<Curriculum> {
    vec![
        Curriculum::new(0.6, 0.6, 1.0, 0.0, 0.0),
        Curriculum::new(0.6, 0.6, 1.0, 1.0, 0.0),
        Curriculum::new(0.6, 0.6, 1.0, 1.0, 1.0),
    ]
}

// ── Phases and loop modes ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    One,
    Two,
}

impl Phase {
    pub fn number(self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase{}", self.number())
    }
}

/// Which training loop(s) a run executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopMode {
    Phase1,
    #[default]
    Phase2,
    /// Phase 1 then phase 2 on the same model.
    Phase1ThenPhase2,
}

impl LoopMode {
    pub fn phases(self) -> &'static [Phase] {
        match self {
            LoopMode::Phase1 => &[Phase::One],
            LoopMode::Phase2 => &[Phase::Two],
            LoopMode::Phase1ThenPhase2 => &[Phase::One, Phase::Two],
        }
    }
}

impl FromStr for LoopMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase1" => Ok(LoopMode::Phase1),
            "phase2" => Ok(LoopMode::Phase2),
            "phase1-then-phase2" => Ok(LoopMode::Phase1ThenPhase2),
            other => Err(ConfigError::UnknownLoopMode(other.to_string())),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopMode::Phase1 => "phase1",
            LoopMode::Phase2 => "phase2",
            LoopMode::Phase1ThenPhase2 => "phase1-then-phase2",
        })
    }
}

// ── Experiment ─────────────────────────────────────────────────────────

/// Everything one invocation of the sweep needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub data: DataParams,
    pub train: TrainParams,
    /// `d_vocab` is ignored here and derived from `data.mod`.
    pub model: TransformerConfig,
    pub curricula: Vec<Curriculum>,
    pub mode: LoopMode,
    /// Master seed; `None` draws from OS entropy.
    pub seed: Option<u64>,
    pub models_dir: PathBuf,
    pub runs_dir: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            data: DataParams::default(),
            train: TrainParams::default(),
            model: TransformerConfig::default(),
            curricula: default_curricula(),
            mode: LoopMode::default(),
            seed: None,
            models_dir: PathBuf::from("models/transformers"),
            runs_dir: PathBuf::from("runs"),
        }
    }
}

impl ExperimentConfig {
    /// Read a JSON config; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.data.vocab()?;
        self.train.validate()?;
        self.transformer_config()?.validate()?;
        if self.curricula.is_empty() {
            return Err(ConfigError::NoCurricula);
        }
        for c in &self.curricula {
            for frac in [c.frac_held_out_phase1, c.frac_held_out_phase2] {
                if !(0.0..=1.0).contains(&frac) {
                    return Err(ConfigError::FractionOutOfRange(frac));
                }
            }
            let weights = Curriculum::new(0.0, 0.0, c.k_p1, c.k_p2, c.k_ln);
            self.train.with_weights(&weights).validate()?;
        }
        Ok(())
    }

    /// Model config with `d_vocab = 2 * mod + 4`.
    pub fn transformer_config(&self) -> Result<TransformerConfig, ConfigError> {
        let vocab = self.data.vocab()?;
        Ok(self.model.clone().with_vocab(vocab.size()))
    }
}
