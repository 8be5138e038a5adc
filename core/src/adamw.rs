/// AdamW optimizer, linear warm-up schedule and global-norm clipping.
///
/// One moment buffer pair per parameter buffer, in `TransformerParams::buffers`
/// order. Weight decay is decoupled (Loshchilov & Hutter 2019) and applies to
/// every buffer.

use serde::{Serialize, Deserialize};

use crate::model::TransformerParams;

/// AdamW hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

/// Moment buffers for a single parameter buffer.
#[derive(Clone)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

/// Core AdamW step on a single (params, grads, m, v) group.
///
/// Modifies params, m, v in place. Uses pre-computed bias correction inverses.
#[inline]
fn adamw_step_buf(
    params: &mut [f32],
    grads: &[f32],
    buf: &mut MomentBuf,
    lr: f32,
    c: &AdamWConfig,
    bc1_inv: f32,
    bc2_inv: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    debug_assert_eq!(params.len(), buf.m.len());
    for i in 0..params.len() {
        let g = grads[i];
        buf.m[i] = c.beta1 * buf.m[i] + (1.0 - c.beta1) * g;
        buf.v[i] = c.beta2 * buf.v[i] + (1.0 - c.beta2) * g * g;
        let m_hat = buf.m[i] * bc1_inv;
        let v_hat = buf.v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + c.eps) + c.weight_decay * params[i]);
    }
}

/// AdamW state for one model.
#[derive(Clone)]
pub struct AdamW {
    pub config: AdamWConfig,
    bufs: Vec<MomentBuf>,
    step: u32,
}

impl AdamW {
    /// Create optimizer state matching the shapes of `params`.
    pub fn new(params: &TransformerParams, config: AdamWConfig) -> Self {
        let bufs = params.buffers().iter().map(|b| MomentBuf::zeros(b.len())).collect();
        AdamW { config, bufs, step: 0 }
    }

    /// Apply one update with learning rate `lr`.
    pub fn step(&mut self, params: &mut TransformerParams, grads: &TransformerParams, lr: f32) {
        self.step += 1;
        let t = self.step as f32;
        let c = &self.config;
        let bc1_inv = 1.0 / (1.0 - c.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - c.beta2.powf(t));

        let grad_bufs = grads.buffers();
        debug_assert_eq!(grad_bufs.len(), self.bufs.len());
        for ((p, g), buf) in params.buffers_mut().into_iter().zip(grad_bufs).zip(self.bufs.iter_mut()) {
            adamw_step_buf(p, g, buf, lr, c, bc1_inv, bc2_inv);
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u32 {
        self.step
    }
}

/// Linear warm-up to a flat learning rate.
///
/// `lr(i) = base_lr * min(i / warm_up_steps, 1)`; `warm_up_steps = 0` is flat.
/// The counter starts at 0 and moves once per `advance`, so the first update
/// runs at `lr(0)`.
#[derive(Clone, Debug, PartialEq)]
pub struct WarmupSchedule {
    base_lr: f32,
    warm_up_steps: usize,
    step: usize,
}

impl WarmupSchedule {
    pub fn new(base_lr: f32, warm_up_steps: usize) -> Self {
        WarmupSchedule { base_lr, warm_up_steps, step: 0 }
    }

    pub fn lr_at(&self, step: usize) -> f32 {
        if self.warm_up_steps == 0 {
            return self.base_lr;
        }
        let frac = (step as f32 / self.warm_up_steps as f32).min(1.0);
        self.base_lr * frac
    }

    /// Learning rate for the next update.
    pub fn lr(&self) -> f32 {
        self.lr_at(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Learning rate after the most recent `advance` (what gets reported).
    pub fn last_lr(&self) -> f32 {
        self.lr()
    }
}

/// Scale `grads` in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. The coefficient `max / (norm + 1e-6)` is
/// applied only when it is below one.
pub fn clip_grad_norm(grads: &mut TransformerParams, max_norm: f32) -> f32 {
    let norm = grads.global_norm();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        grads.scale(coef);
    }
    norm
}
