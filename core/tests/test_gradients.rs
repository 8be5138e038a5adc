//! Finite-difference checks of the transformer backward pass.
//!
//! FD eps is large enough for f32 to resolve loss differences; tolerance
//! covers both FD truncation and f32 rounding.

use oocl_core::gradient::{check_weight_gradient, compute_gradients};
use oocl_core::model::{ActFn, NormKind, Transformer, TransformerConfig, TransformerParams};
use oocl_core::stream::TokenBatch;

const FD_EPS: f32 = 1e-2;
const FD_TOL: f32 = 0.10;
const SAMPLES: usize = 20;

/// Tiny config: smaller model = larger gradients per parameter = better FD resolution.
fn grad_check_config() -> TransformerConfig {
    TransformerConfig {
        d_vocab: 14,
        n_layers: 2,
        d_model: 8,
        d_head: 4,
        n_heads: 2,
        d_mlp: 12,
        n_ctx: 5,
        act_fn: ActFn::Gelu,
        normalization_type: NormKind::LayerNorm,
        attn_only: true,
    }
}

fn make_batch() -> TokenBatch {
    // mod=5 layout: 10 = equal, 11 = true, 13 = define
    TokenBatch::new(vec![11, 1, 2, 10, 3, 13, 13, 7, 10, 2], 5).unwrap()
}

fn assert_grad(
    cfg: TransformerConfig,
    name: &str,
    get: impl Fn(&TransformerParams) -> &Vec<f32>,
    set: impl Fn(&mut TransformerParams, usize, f32),
) {
    let model = Transformer::new(cfg, 42).unwrap();
    let batch = make_batch();
    let (_loss, grads) = compute_gradients(&model, &batch).unwrap();
    let (checked, passed, max_err) = check_weight_gradient(
        &model, &batch, &grads, name, get, set, SAMPLES, FD_EPS, FD_TOL,
    )
    .unwrap();
    eprintln!("{name}: {passed}/{checked} pass, max_rel_err={max_err:.4e}");
    assert!(checked > 0);
    assert!(passed == checked, "{name}: {passed}/{checked} passed, max_rel_err={max_err:.4e}");
}

fn mlp_config() -> TransformerConfig {
    TransformerConfig { attn_only: false, ..grad_check_config() }
}

fn no_norm_config() -> TransformerConfig {
    TransformerConfig { normalization_type: NormKind::Identity, ..grad_check_config() }
}

// ── Unembedding and final norm ─────────────────────────────────────────

#[test]
fn test_gradient_w_unembed() {
    assert_grad(grad_check_config(), "w_unembed", |p| &p.w_unembed, |p, i, v| p.w_unembed[i] = v);
}

#[test]
fn test_gradient_b_unembed() {
    assert_grad(grad_check_config(), "b_unembed", |p| &p.b_unembed, |p, i, v| p.b_unembed[i] = v);
}

#[test]
fn test_gradient_ln_final() {
    assert_grad(grad_check_config(), "ln_final_w", |p| &p.ln_final_w, |p, i, v| p.ln_final_w[i] = v);
    assert_grad(grad_check_config(), "ln_final_b", |p| &p.ln_final_b, |p, i, v| p.ln_final_b[i] = v);
}

// ── Attention block ────────────────────────────────────────────────────

#[test]
fn test_gradient_w_q() {
    assert_grad(grad_check_config(), "layers[0].w_q", |p| &p.layers[0].w_q, |p, i, v| p.layers[0].w_q[i] = v);
    assert_grad(grad_check_config(), "layers[1].w_q", |p| &p.layers[1].w_q, |p, i, v| p.layers[1].w_q[i] = v);
}

#[test]
fn test_gradient_w_k() {
    assert_grad(grad_check_config(), "layers[0].w_k", |p| &p.layers[0].w_k, |p, i, v| p.layers[0].w_k[i] = v);
}

#[test]
fn test_gradient_w_v() {
    assert_grad(grad_check_config(), "layers[0].w_v", |p| &p.layers[0].w_v, |p, i, v| p.layers[0].w_v[i] = v);
}

#[test]
fn test_gradient_w_o() {
    assert_grad(grad_check_config(), "layers[1].w_o", |p| &p.layers[1].w_o, |p, i, v| p.layers[1].w_o[i] = v);
    assert_grad(grad_check_config(), "layers[0].b_o", |p| &p.layers[0].b_o, |p, i, v| p.layers[0].b_o[i] = v);
}

#[test]
fn test_gradient_attention_biases() {
    assert_grad(grad_check_config(), "layers[0].b_q", |p| &p.layers[0].b_q, |p, i, v| p.layers[0].b_q[i] = v);
    assert_grad(grad_check_config(), "layers[0].b_v", |p| &p.layers[0].b_v, |p, i, v| p.layers[0].b_v[i] = v);
}

#[test]
fn test_gradient_ln1() {
    assert_grad(grad_check_config(), "layers[0].ln1_w", |p| &p.layers[0].ln1_w, |p, i, v| p.layers[0].ln1_w[i] = v);
    assert_grad(grad_check_config(), "layers[1].ln1_b", |p| &p.layers[1].ln1_b, |p, i, v| p.layers[1].ln1_b[i] = v);
}

// ── Embeddings ─────────────────────────────────────────────────────────

#[test]
fn test_gradient_w_embed() {
    assert_grad(grad_check_config(), "w_embed", |p| &p.w_embed, |p, i, v| p.w_embed[i] = v);
}

#[test]
fn test_gradient_w_pos() {
    assert_grad(grad_check_config(), "w_pos", |p| &p.w_pos, |p, i, v| p.w_pos[i] = v);
}

// ── MLP and no-norm variants ───────────────────────────────────────────

#[test]
fn test_gradient_mlp() {
    assert_grad(mlp_config(), "layers[0].w_in", |p| &p.layers[0].w_in, |p, i, v| p.layers[0].w_in[i] = v);
    assert_grad(mlp_config(), "layers[1].w_out", |p| &p.layers[1].w_out, |p, i, v| p.layers[1].w_out[i] = v);
    assert_grad(mlp_config(), "layers[0].b_in", |p| &p.layers[0].b_in, |p, i, v| p.layers[0].b_in[i] = v);
    assert_grad(mlp_config(), "layers[1].ln2_w", |p| &p.layers[1].ln2_w, |p, i, v| p.layers[1].ln2_w[i] = v);
}

#[test]
fn test_gradient_without_normalization() {
    assert_grad(no_norm_config(), "w_q (no norm)", |p| &p.layers[0].w_q, |p, i, v| p.layers[0].w_q[i] = v);
    assert_grad(no_norm_config(), "w_embed (no norm)", |p| &p.w_embed, |p, i, v| p.w_embed[i] = v);
}

#[test]
fn test_unused_token_rows_get_no_gradient() {
    let model = Transformer::new(grad_check_config(), 42).unwrap();
    let (_, grads) = compute_gradients(&model, &make_batch()).unwrap();
    let d = model.cfg.d_model;
    // token 0 never appears in the batch
    assert!(grads.w_embed[0..d].iter().all(|&g| g == 0.0));
    // token 1 does
    assert!(grads.w_embed[d..2 * d].iter().any(|&g| g != 0.0));
}
