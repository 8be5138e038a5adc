/// Hand-written backward pass for every stage of the transformer.
///
/// Mirrors `forward::forward` stage by stage in reverse. Parameter gradients
/// accumulate into a caller-owned `TransformerParams` shadow so that several
/// objectives can share one buffer before the optimizer step.

use crate::attention::causal_attention_backward;
use crate::forward::{ForwardCache, NormCache};
use crate::model::{ActFn, TransformerConfig, TransformerParams};
use crate::tensor::{
    col_sum_acc, gelu_prime_f32, layer_norm_backward_f32, matmul_nt_acc_f32, matmul_tn_acc_f32,
};

fn activate_prime(act: ActFn, x: f32) -> f32 {
    match act {
        ActFn::Gelu => gelu_prime_f32(x),
        ActFn::Relu => if x > 0.0 { 1.0 } else { 0.0 },
    }
}

/// Backprop through `y = x @ w + b` where x: [rows, k], w: [k, n].
/// Accumulates dW, db and returns dx.
fn affine_backward(
    x: &[f32],
    w: &[f32],
    dy: &[f32],
    dw: &mut [f32],
    db: &mut [f32],
    rows: usize,
    k: usize,
    n: usize,
) -> Vec<f32> {
    matmul_tn_acc_f32(x, dy, dw, rows, k, n);
    col_sum_acc(dy, db, rows, n);
    let mut dx = vec![0.0f32; rows * k];
    matmul_nt_acc_f32(dy, w, &mut dx, rows, n, k);
    dx
}

/// Route `d_normed` through the normalization back into `d_resid`.
fn normalize_backward(
    cfg: &TransformerConfig,
    d_normed: &[f32],
    cache: &NormCache,
    w: &[f32],
    dw: &mut [f32],
    db: &mut [f32],
    d_resid: &mut [f32],
    rows: usize,
) {
    if cfg.has_norm() {
        layer_norm_backward_f32(
            d_normed, &cache.x_hat, &cache.inv_std, w, d_resid, dw, db, rows, cfg.d_model,
        );
    } else {
        for (r, g) in d_resid.iter_mut().zip(d_normed) {
            *r += g;
        }
    }
}

/// Accumulate parameter gradients for upstream `d_logits` ([batch, seq_len, vocab]).
pub fn backward(
    params: &TransformerParams,
    cfg: &TransformerConfig,
    cache: &ForwardCache,
    d_logits: &[f32],
    grads: &mut TransformerParams,
) {
    let bsz = cache.batch;
    let s = cache.seq_len;
    let rows = bsz * s;
    let d = cfg.d_model;
    let a = cfg.d_attn();
    let nh = cfg.n_heads;
    let hd = cfg.d_head;
    let v = cfg.d_vocab;
    debug_assert_eq!(d_logits.len(), rows * v);

    // ── Stage 3: unembed + final norm ────────────────────────────────
    let d_normed = affine_backward(
        &cache.normed_final, &params.w_unembed, d_logits,
        &mut grads.w_unembed, &mut grads.b_unembed, rows, d, v,
    );
    let mut d_resid = vec![0.0f32; rows * d];
    normalize_backward(
        cfg, &d_normed, &cache.ln_final, &params.ln_final_w,
        &mut grads.ln_final_w, &mut grads.ln_final_b, &mut d_resid, rows,
    );

    // ── Stage 2: blocks, last to first ───────────────────────────────
    for ((lp, lg), lc) in params.layers.iter()
        .zip(grads.layers.iter_mut())
        .zip(cache.layers.iter())
        .rev()
    {
        if !cfg.attn_only {
            let m = cfg.d_mlp;
            let d_post = affine_backward(
                &lc.mlp_post, &lp.w_out, &d_resid, &mut lg.w_out, &mut lg.b_out, rows, m, d,
            );
            let d_pre: Vec<f32> = d_post.iter()
                .zip(&lc.mlp_pre)
                .map(|(g, &x)| g * activate_prime(cfg.act_fn, x))
                .collect();
            let d_normed2 = affine_backward(
                &lc.normed2, &lp.w_in, &d_pre, &mut lg.w_in, &mut lg.b_in, rows, d, m,
            );
            normalize_backward(
                cfg, &d_normed2, &lc.ln2, &lp.ln2_w, &mut lg.ln2_w, &mut lg.ln2_b, &mut d_resid, rows,
            );
        }

        let d_z = affine_backward(&lc.z, &lp.w_o, &d_resid, &mut lg.w_o, &mut lg.b_o, rows, a, d);

        let mut d_q = vec![0.0f32; rows * a];
        let mut d_k = vec![0.0f32; rows * a];
        let mut d_v = vec![0.0f32; rows * a];
        for b in 0..bsz {
            let span = b * s * a..(b + 1) * s * a;
            let aw_span = b * nh * s * s..(b + 1) * nh * s * s;
            causal_attention_backward(
                &lc.q[span.clone()], &lc.k[span.clone()], &lc.v[span.clone()],
                &lc.attn_weights[aw_span], &d_z[span.clone()],
                &mut d_q[span.clone()], &mut d_k[span.clone()], &mut d_v[span],
                s, nh, hd,
            );
        }

        let mut d_normed1 =
            affine_backward(&lc.normed1, &lp.w_q, &d_q, &mut lg.w_q, &mut lg.b_q, rows, d, a);
        let from_k = affine_backward(&lc.normed1, &lp.w_k, &d_k, &mut lg.w_k, &mut lg.b_k, rows, d, a);
        let from_v = affine_backward(&lc.normed1, &lp.w_v, &d_v, &mut lg.w_v, &mut lg.b_v, rows, d, a);
        for ((g, gk), gv) in d_normed1.iter_mut().zip(&from_k).zip(&from_v) {
            *g += gk + gv;
        }
        normalize_backward(
            cfg, &d_normed1, &lc.ln1, &lp.ln1_w, &mut lg.ln1_w, &mut lg.ln1_b, &mut d_resid, rows,
        );
    }

    // ── Stage 1: embedding scatter ───────────────────────────────────
    for (r, &tok) in cache.tokens.iter().enumerate() {
        let pos = r % s;
        let g = &d_resid[r * d..(r + 1) * d];
        for (dst, x) in grads.w_embed[tok * d..(tok + 1) * d].iter_mut().zip(g) {
            *dst += x;
        }
        for (dst, x) in grads.w_pos[pos * d..(pos + 1) * d].iter_mut().zip(g) {
            *dst += x;
        }
    }
}
