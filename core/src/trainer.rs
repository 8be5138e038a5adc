//! Phase-1 and phase-2 training loops.
//!
//! Each loop owns a fresh AdamW state and warm-up schedule, pulls one batch
//! per active stream per step, and every `n_steps_epoch` steps evaluates one
//! fresh validation batch per operation stream. The cancellation flag is
//! polled at the top of every step.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::adamw::{clip_grad_norm, AdamW, AdamWConfig, WarmupSchedule};
use crate::checkpoint::{checkpoint_path, save_checkpoint, CheckpointTag};
use crate::error::TrainError;
use crate::gradient::accumulate_objective;
use crate::loss::{accuracy, binop_loss, binop_loss_grad, linkage_loss_grad};
use crate::metrics::{MetricsRecord, MetricsSink};
use crate::model::{Transformer, TransformerParams};
use crate::config::TrainParams;
use crate::stream::BatchStream;

/// How a loop ended when it was not interrupted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrainOutcome {
    Completed { steps: usize },
    EarlyStop { step: usize, valid_loss: f32 },
}

/// Per-run plumbing shared by both loops.
pub struct TrainContext<'a> {
    /// Prefix of step checkpoints, e.g. `<run>_phase2`.
    pub model_name: &'a str,
    pub ts_start: u64,
    pub models_dir: &'a Path,
    pub sink: &'a mut dyn MetricsSink,
    pub cancel: &'a AtomicBool,
}

impl TrainContext<'_> {
    fn check_cancel(&self, step: usize) -> Result<(), TrainError> {
        if self.cancel.load(Ordering::Relaxed) {
            log::warn!("{}: interrupted at step {step}", self.model_name);
            return Err(TrainError::Interrupted { step });
        }
        Ok(())
    }

    fn maybe_checkpoint(
        &self,
        model: &Transformer,
        params: &TrainParams,
        step: usize,
    ) -> Result<(), TrainError> {
        if let Some(every) = params.save_every {
            if step % every == 0 {
                let path = checkpoint_path(self.models_dir, self.model_name, self.ts_start, CheckpointTag::Step(step));
                save_checkpoint(&path, model)?;
                log::info!("saved checkpoint {}", path.display());
            }
        }
        Ok(())
    }
}

/// Streams consumed by phase 1.
pub struct Phase1Streams<'a> {
    pub train: &'a mut dyn BatchStream,
    pub valid: &'a mut dyn BatchStream,
}

/// Streams consumed by phase 2, drawn in field order every step.
pub struct Phase2Streams<'a> {
    pub train_p1: &'a mut dyn BatchStream,
    pub train_p2: &'a mut dyn BatchStream,
    pub valid_p1: &'a mut dyn BatchStream,
    pub valid_p2: &'a mut dyn BatchStream,
    pub linkage: &'a mut dyn BatchStream,
}

// ── Shared step machinery ──────────────────────────────────────────────

/// Rolling per-term training losses between validations.
#[derive(Clone, Debug, Default)]
pub struct LossWindow {
    losses: Vec<f32>,
}

impl LossWindow {
    pub fn push(&mut self, loss: f32) {
        self.losses.push(loss);
    }

    /// Keep only the most recent `n` entries.
    pub fn truncate_to(&mut self, n: usize) {
        if self.losses.len() > n {
            self.losses.drain(..self.losses.len() - n);
        }
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.losses.is_empty() {
            return f64::NAN;
        }
        self.losses.iter().map(|&l| l as f64).sum::<f64>() / self.losses.len() as f64
    }
}

/// AdamW + schedule + clipping + the reusable gradient buffer.
struct Optimizer {
    adamw: AdamW,
    schedule: WarmupSchedule,
    max_grad_norm: Option<f32>,
    grads: TransformerParams,
}

impl Optimizer {
    fn new(model: &Transformer, params: &TrainParams) -> Self {
        let config = AdamWConfig {
            beta1: params.betas.0,
            beta2: params.betas.1,
            weight_decay: params.wd,
            ..AdamWConfig::default()
        };
        Optimizer {
            adamw: AdamW::new(&model.params, config),
            schedule: WarmupSchedule::new(params.lr, params.warm_up_steps),
            max_grad_norm: params.max_grad_norm,
            grads: model.zero_grads(),
        }
    }

    /// Clip, update, advance the schedule, clear the gradient buffer.
    fn apply(&mut self, model: &mut Transformer) {
        if let Some(max) = self.max_grad_norm {
            let norm = clip_grad_norm(&mut self.grads, max);
            log::trace!("grad norm {norm:.4}");
        }
        self.adamw.step(&mut model.params, &self.grads, self.schedule.lr());
        self.schedule.advance();
        self.grads.zero();
    }

    fn last_lr(&self) -> f32 {
        self.schedule.last_lr()
    }
}

fn is_validation_step(step: usize, params: &TrainParams) -> bool {
    step > 0 && step % params.n_steps_epoch == 0
}

// ── Phase 1 ────────────────────────────────────────────────────────────

/// Train on the original-token operation only.
pub fn train_phase1(
    model: &mut Transformer,
    streams: Phase1Streams<'_>,
    params: &TrainParams,
    ctx: &mut TrainContext<'_>,
) -> Result<TrainOutcome, TrainError> {
    let mut opt = Optimizer::new(model, params);
    let mut window = LossWindow::default();

    for step in 0..params.n_steps {
        ctx.check_cancel(step)?;

        let batch = streams.train.next_batch();
        let loss = accumulate_objective(model, &batch, binop_loss_grad, 1.0, &mut opt.grads)?;
        opt.apply(model);
        window.push(loss);

        if !is_validation_step(step, params) {
            continue;
        }
        window.truncate_to(params.n_steps_epoch);
        let train_loss = window.mean();

        let valid = streams.valid.next_batch();
        let valid_loss = binop_loss(&model.logits(&valid)?, &valid)?;
        let lr = opt.last_lr();
        log::info!(
            "step: {step}, train_loss: {train_loss:.5}, valid_loss: {valid_loss:.5}, lr: {lr:.5}"
        );
        ctx.sink.log(
            &MetricsRecord::new(step)
                .with("train/loss", train_loss)
                .with("valid/loss", valid_loss)
                .with("learning_rate", lr),
        )?;

        ctx.maybe_checkpoint(model, params, step)?;

        if let Some(threshold) = params.early_stop_valid_loss {
            if valid_loss < threshold {
                log::info!("early stopping: valid loss below {threshold} at step {step}");
                return Ok(TrainOutcome::EarlyStop { step, valid_loss });
            }
        }
    }

    Ok(TrainOutcome::Completed { steps: params.n_steps })
}

// ── Phase 2 ────────────────────────────────────────────────────────────

/// Train jointly on originals, aliases and linkages with weighted losses.
///
/// Objective: `k_p1 * loss_p1 + k_p2 * loss_p2 + k_ln * loss_linkage`.
/// Zero-weight terms are still evaluated and reported.
pub fn train_phase2(
    model: &mut Transformer,
    streams: Phase2Streams<'_>,
    params: &TrainParams,
    ctx: &mut TrainContext<'_>,
) -> Result<TrainOutcome, TrainError> {
    let mut opt = Optimizer::new(model, params);
    let mut win_p1 = LossWindow::default();
    let mut win_p2 = LossWindow::default();
    let mut win_ln = LossWindow::default();

    for step in 0..params.n_steps {
        ctx.check_cancel(step)?;

        let batch_p1 = streams.train_p1.next_batch();
        let batch_p2 = streams.train_p2.next_batch();
        let batch_ln = streams.linkage.next_batch();
        let loss_p1 = accumulate_objective(model, &batch_p1, binop_loss_grad, params.k_p1, &mut opt.grads)?;
        let loss_p2 = accumulate_objective(model, &batch_p2, binop_loss_grad, params.k_p2, &mut opt.grads)?;
        let loss_ln = accumulate_objective(model, &batch_ln, linkage_loss_grad, params.k_ln, &mut opt.grads)?;
        opt.apply(model);
        win_p1.push(loss_p1);
        win_p2.push(loss_p2);
        win_ln.push(loss_ln);

        if !is_validation_step(step, params) {
            continue;
        }
        for w in [&mut win_p1, &mut win_p2, &mut win_ln] {
            w.truncate_to(params.n_steps_epoch);
        }
        let (train_p1, train_p2, train_ln) = (win_p1.mean(), win_p2.mean(), win_ln.mean());

        let valid_p1 = streams.valid_p1.next_batch();
        let valid_p2 = streams.valid_p2.next_batch();
        let logits_p1 = model.logits(&valid_p1)?;
        let logits_p2 = model.logits(&valid_p2)?;
        let valid_loss_p1 = binop_loss(&logits_p1, &valid_p1)?;
        let valid_loss_p2 = binop_loss(&logits_p2, &valid_p2)?;
        let acc_p1 = accuracy(&logits_p1, &valid_p1)?;
        let acc_p2 = accuracy(&logits_p2, &valid_p2)?;
        let lr = opt.last_lr();

        log::info!(
            "step: {step}, train_loss_binop_p1: {train_p1:.5}, train_loss_binop_p2: {train_p2:.5}, \
             train_loss_linkages: {train_ln:.5}, valid_loss_binop_p1: {valid_loss_p1:.5}, \
             valid_loss_binop_p2: {valid_loss_p2:.5}, valid_acc_binop_p1: {acc_p1:.5}, \
             valid_acc_binop_p2: {acc_p2:.5}, lr: {lr:.5}"
        );
        ctx.sink.log(
            &MetricsRecord::new(step)
                .with("train/loss_binop_p1", train_p1)
                .with("train/loss_binop_p2", train_p2)
                .with("train/loss_linkages", train_ln)
                .with("valid/loss_binop_p1", valid_loss_p1)
                .with("valid/loss_binop_p2", valid_loss_p2)
                .with("valid/acc_binop_p1", acc_p1)
                .with("valid/acc_binop_p2", acc_p2)
                .with("learning_rate", lr),
        )?;

        ctx.maybe_checkpoint(model, params, step)?;
    }

    Ok(TrainOutcome::Completed { steps: params.n_steps })
}
