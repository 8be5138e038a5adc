/// Model persistence: JSON `{config, params}` files and their naming scheme.
///
/// Step checkpoints: `<models_dir>/<model_name>.<ts>.<step:010>.json`
/// Final model:      `<models_dir>/<model_name>.<ts>.final.json`
/// Interrupted run:  `<models_dir>/phase{1|2}_interrupted.json`

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

use crate::config::Phase;
use crate::error::CheckpointError;
use crate::model::{Transformer, TransformerConfig, TransformerParams};

/// On-disk checkpoint format.
#[derive(Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub config: TransformerConfig,
    pub params: TransformerParams,
}

/// Which moment of a run a checkpoint captures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointTag {
    Step(usize),
    Final,
    Interrupted(Phase),
}

/// Path for a checkpoint of `model_name` started at unix time `ts_start`.
pub fn checkpoint_path(models_dir: &Path, model_name: &str, ts_start: u64, tag: CheckpointTag) -> PathBuf {
    let file = match tag {
        CheckpointTag::Step(step) => format!("{model_name}.{ts_start}.{step:010}.json"),
        CheckpointTag::Final => format!("{model_name}.{ts_start}.final.json"),
        CheckpointTag::Interrupted(phase) => format!("phase{}_interrupted.json", phase.number()),
    };
    models_dir.join(file)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io { path: path.display().to_string(), source }
}

/// Save config + params to `path`, creating parent directories.
pub fn save_checkpoint(path: &Path, model: &Transformer) -> Result<(), CheckpointError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
    }
    let checkpoint = ModelCheckpoint { config: model.cfg.clone(), params: model.params.clone() };
    let json = serde_json::to_string(&checkpoint)?;
    fs::write(path, json).map_err(io_err(path))?;
    log::debug!("saved checkpoint {}", path.display());
    Ok(())
}

/// Load a model saved by `save_checkpoint`.
pub fn load_checkpoint(path: &Path) -> Result<Transformer, CheckpointError> {
    let json = fs::read_to_string(path).map_err(io_err(path))?;
    let checkpoint: ModelCheckpoint = serde_json::from_str(&json)?;
    Ok(Transformer::from_parts(checkpoint.config, checkpoint.params))
}
