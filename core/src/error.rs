//! Error taxonomy for the harness.
//!
//! Configuration errors fail fast before any run starts. Shape errors come
//! out of the loss evaluators and the forward pass. Interruption is the only
//! error with a recovery path (emergency checkpoint in the driver).

use thiserror::Error;

/// Rejected configuration: detected before a run is constructed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown operation {0:?} (expected \"sum\" or \"ssq\")")]
    UnknownOperation(String),
    #[error("unknown loop mode {0:?} (expected phase1, phase2 or phase1-then-phase2)")]
    UnknownLoopMode(String),
    #[error("modulus must be at least 1")]
    ZeroModulus,
    #[error("held-out fraction {0} is outside [0, 1]")]
    FractionOutOfRange(f64),
    #[error("mask selects no cells; cannot sample {0} batches")]
    DegenerateMask(&'static str),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("validation cadence n_steps_epoch must be at least 1")]
    ZeroValidationCadence,
    #[error("checkpoint cadence save_every must be at least 1 when set")]
    ZeroCheckpointCadence,
    #[error("invalid hyperparameter {name}: {value}")]
    InvalidHyperparameter { name: &'static str, value: f64 },
    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error("vocabulary mismatch: model has d_vocab={model}, data needs {data}")]
    VocabMismatch { model: usize, data: usize },
    #[error("no curricula configured")]
    NoCurricula,
    #[error("failed to read config {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
}

/// Malformed batch or logits reaching an evaluator or the model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("sequence length {found} is shorter than the required {required}")]
    SequenceTooShort { found: usize, required: usize },
    #[error("token buffer of {len} ids is not a whole number of {seq_len}-token rows")]
    RaggedBatch { len: usize, seq_len: usize },
    #[error("logits cover batch {logits_batch} x {logits_seq} positions, tokens are {tokens_batch} x {tokens_seq}")]
    BatchMismatch {
        logits_batch: usize,
        logits_seq: usize,
        tokens_batch: usize,
        tokens_seq: usize,
    },
    #[error("token id {token} is outside the vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },
    #[error("sequence length {seq_len} exceeds model context {n_ctx}")]
    ContextOverflow { seq_len: usize, n_ctx: usize },
    #[error("empty batch")]
    EmptyBatch,
}

/// Model persistence failures.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl CheckpointError {
    /// Underlying I/O error kind, if this was an I/O failure.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            CheckpointError::Io { source, .. } => Some(source.kind()),
            CheckpointError::Json(_) => None,
        }
    }
}

/// Metrics sink failures.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metrics sink has no open run")]
    NoOpenRun,
}

/// Everything that can end a training run early.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("training interrupted at step {step}")]
    Interrupted { step: usize },
}

impl TrainError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TrainError::Interrupted { .. })
    }
}
