/// Gradient orchestration and verification.
///
/// Provides:
/// - `accumulate_objective`: forward one batch, score it, backprop the weighted
///   loss into a shared gradient buffer (the training loop's building block)
/// - `compute_gradients`: single operation-loss gradient, fresh buffer
/// - `check_weight_gradient`: central finite differences against backward

use crate::error::ShapeError;
use crate::forward::Logits;
use crate::loss::{binop_loss, binop_loss_grad};
use crate::model::{Transformer, TransformerParams};
use crate::stream::TokenBatch;

/// Loss evaluator that also yields the weighted logit gradient.
pub type LossGradFn = fn(&Logits, &TokenBatch, f32) -> Result<(f32, Vec<f32>), ShapeError>;

/// Forward `batch`, evaluate `loss_fn`, and add `weight * d loss / d params`
/// into `grads`. Returns the unweighted loss.
///
/// A zero weight still computes and returns the loss but skips backward.
pub fn accumulate_objective(
    model: &Transformer,
    batch: &TokenBatch,
    loss_fn: LossGradFn,
    weight: f32,
    grads: &mut TransformerParams,
) -> Result<f32, ShapeError> {
    let (logits, cache) = model.forward(batch)?;
    let (loss, d_logits) = loss_fn(&logits, batch, weight)?;
    if weight != 0.0 {
        model.backward(&cache, &d_logits, grads);
    }
    Ok(loss)
}

/// Operation-loss gradient with respect to all parameters.
pub fn compute_gradients(
    model: &Transformer,
    batch: &TokenBatch,
) -> Result<(f32, TransformerParams), ShapeError> {
    let mut grads = model.zero_grads();
    let loss = accumulate_objective(model, batch, binop_loss_grad, 1.0, &mut grads)?;
    Ok((loss, grads))
}

/// Compute finite-difference gradient for a single weight element.
/// Uses central differences: (f(x+eps) - f(x-eps)) / (2*eps).
fn fd_single(
    model: &Transformer,
    batch: &TokenBatch,
    get_weight: impl Fn(&TransformerParams) -> &Vec<f32>,
    set_weight: impl Fn(&mut TransformerParams, usize, f32),
    idx: usize,
    eps: f32,
) -> Result<f32, ShapeError> {
    let orig = get_weight(&model.params)[idx];

    let mut plus = model.clone();
    set_weight(&mut plus.params, idx, orig + eps);
    let loss_plus = binop_loss(&plus.logits(batch)?, batch)?;

    let mut minus = model.clone();
    set_weight(&mut minus.params, idx, orig - eps);
    let loss_minus = binop_loss(&minus.logits(batch)?, batch)?;

    Ok((loss_plus - loss_minus) / (2.0 * eps))
}

/// Check the analytical gradient of one weight buffer against finite
/// differences on up to `num_samples` evenly spaced elements.
/// Returns (num_checked, num_passed, max_relative_error).
///
/// Relative error uses denominator max(|a|, |b|); elements where both are
/// below 5e-4 pass automatically (below f32 FD resolution).
pub fn check_weight_gradient(
    model: &Transformer,
    batch: &TokenBatch,
    grads: &TransformerParams,
    name: &str,
    get_weight: impl Fn(&TransformerParams) -> &Vec<f32>,
    set_weight: impl Fn(&mut TransformerParams, usize, f32),
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> Result<(usize, usize, f32), ShapeError> {
    let abs_threshold = 5e-4;
    let grad_vec = get_weight(grads);
    let n = grad_vec.len();

    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f32;

    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grad_vec[idx];
        let numerical = fd_single(model, batch, &get_weight, &set_weight, idx, eps)?;

        let denom = analytical.abs().max(numerical.abs());
        checked += 1;
        if denom < abs_threshold {
            passed += 1;
            continue;
        }

        let rel_err = (analytical - numerical).abs() / denom;
        max_rel_err = max_rel_err.max(rel_err);
        if rel_err < tol {
            passed += 1;
        } else {
            log::warn!(
                "FAIL {name}[{idx}]: analytical={analytical:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }

    Ok((checked, passed, max_rel_err))
}
