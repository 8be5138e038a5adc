//! Out-of-context learning (OOCL) training harness.
//!
//! Data generation, a CPU reference transformer with analytical backward,
//! and the phase-1 / phase-2 training loops with their experiment driver.

pub mod error;
pub mod vocab;
pub mod table;
pub mod stream;
pub mod tensor;
pub mod attention;
pub mod model;
pub mod forward;
pub mod backward;
pub mod loss;
pub mod gradient;
pub mod adamw;
pub mod checkpoint;
pub mod metrics;
pub mod config;
pub mod trainer;
pub mod experiment;

pub use config::{ExperimentConfig, LoopMode, Phase, TrainParams};
pub use error::{CheckpointError, ConfigError, MetricsError, ShapeError, TrainError};
pub use experiment::{run_experiment, RunSummary};
pub use model::{Transformer, TransformerConfig};
pub use trainer::TrainOutcome;
