//! Loss evaluators over `[batch, seq_len, vocab]` logits.
//!
//! Every sample predicts a single token: logits at position 3 (the `equal`
//! token) scored against the token at position 4. The `*_grad` variants also
//! return d(weight * loss)/d(logits), which is zero everywhere except
//! position 3.

use crate::error::ShapeError;
use crate::forward::Logits;
use crate::stream::{TokenBatch, SEQ_LEN};
use crate::tensor::{argmax, log_softmax_at, softmax_f32};

/// Position whose logits carry the prediction.
pub const PREDICT_POS: usize = 3;
/// Position holding the expected answer.
pub const TARGET_POS: usize = 4;

fn check_shapes(logits: &Logits, tokens: &TokenBatch) -> Result<(), ShapeError> {
    if tokens.seq_len() < SEQ_LEN {
        return Err(ShapeError::SequenceTooShort { found: tokens.seq_len(), required: SEQ_LEN });
    }
    if logits.batch_size() != tokens.batch_size() || logits.seq_len() != tokens.seq_len() {
        return Err(ShapeError::BatchMismatch {
            logits_batch: logits.batch_size(),
            logits_seq: logits.seq_len(),
            tokens_batch: tokens.batch_size(),
            tokens_seq: tokens.seq_len(),
        });
    }
    let vocab = logits.vocab_size();
    if let Some(token) = tokens.column(TARGET_POS).into_iter().find(|&t| t >= vocab) {
        return Err(ShapeError::TokenOutOfRange { token, vocab_size: vocab });
    }
    Ok(())
}

/// Mean negative log-probability of the answer token.
fn answer_nll(logits: &Logits, tokens: &TokenBatch) -> Result<f32, ShapeError> {
    check_shapes(logits, tokens)?;
    let total: f64 = tokens
        .rows()
        .enumerate()
        .map(|(b, row)| -(log_softmax_at(logits.row(b, PREDICT_POS), row[TARGET_POS]) as f64))
        .sum();
    Ok((total / tokens.batch_size() as f64) as f32)
}

/// `answer_nll` plus its logit gradient scaled by `weight`.
fn answer_nll_grad(
    logits: &Logits,
    tokens: &TokenBatch,
    weight: f32,
) -> Result<(f32, Vec<f32>), ShapeError> {
    let loss = answer_nll(logits, tokens)?;
    let (bsz, s, v) = (logits.batch_size(), logits.seq_len(), logits.vocab_size());
    let mut d_logits = vec![0.0f32; bsz * s * v];
    if weight == 0.0 {
        return Ok((loss, d_logits));
    }
    let scale = weight / bsz as f32;
    for (b, row) in tokens.rows().enumerate() {
        let base = (b * s + PREDICT_POS) * v;
        let out = &mut d_logits[base..base + v];
        softmax_f32(logits.row(b, PREDICT_POS), out, 1, v);
        out[row[TARGET_POS]] -= 1.0;
        for g in out.iter_mut() {
            *g *= scale;
        }
    }
    Ok((loss, d_logits))
}

/// Cross-entropy of the operation answer.
pub fn binop_loss(logits: &Logits, tokens: &TokenBatch) -> Result<f32, ShapeError> {
    answer_nll(logits, tokens)
}

/// Cross-entropy of the linkage counterpart. Same form as `binop_loss`,
/// kept separate so the two objectives are reported independently.
pub fn linkage_loss(logits: &Logits, tokens: &TokenBatch) -> Result<f32, ShapeError> {
    answer_nll(logits, tokens)
}

pub fn binop_loss_grad(
    logits: &Logits,
    tokens: &TokenBatch,
    weight: f32,
) -> Result<(f32, Vec<f32>), ShapeError> {
    answer_nll_grad(logits, tokens, weight)
}

pub fn linkage_loss_grad(
    logits: &Logits,
    tokens: &TokenBatch,
    weight: f32,
) -> Result<(f32, Vec<f32>), ShapeError> {
    answer_nll_grad(logits, tokens, weight)
}

/// Fraction of rows whose position-3 argmax equals the position-4 token.
pub fn accuracy(logits: &Logits, tokens: &TokenBatch) -> Result<f32, ShapeError> {
    check_shapes(logits, tokens)?;
    let hits = tokens
        .rows()
        .enumerate()
        .filter(|(b, row)| argmax(logits.row(*b, PREDICT_POS)) == row[TARGET_POS])
        .count();
    Ok(hits as f32 / tokens.batch_size() as f32)
}
