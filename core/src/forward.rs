/// Full forward pass: embed → [LN → attention → residual → (LN → MLP → residual)] × L → LN → unembed.
///
/// The batch is processed as `batch * seq_len` independent rows for every
/// projection; attention runs per sequence. All intermediate buffers the
/// backward pass needs are returned in a `ForwardCache`.

use crate::attention::causal_attention_forward;
use crate::model::{ActFn, TransformerConfig, TransformerParams};
use crate::stream::TokenBatch;
use crate::tensor::{add_bias_rows, gelu_f32, layer_norm_f32, matmul_f32};

/// Unnormalized next-token scores, `[batch, seq_len, vocab]` row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Logits {
    data: Vec<f32>,
    batch: usize,
    seq_len: usize,
    vocab: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, batch: usize, seq_len: usize, vocab: usize) -> Self {
        debug_assert_eq!(data.len(), batch * seq_len * vocab);
        Logits { data, batch, seq_len, vocab }
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab
    }

    /// Scores at position `pos` of sequence `b`.
    pub fn row(&self, b: usize, pos: usize) -> &[f32] {
        let base = (b * self.seq_len + pos) * self.vocab;
        &self.data[base..base + self.vocab]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Normalization cache. Empty buffers when normalization is disabled.
#[derive(Clone, Debug, Default)]
pub struct NormCache {
    /// Normalized, pre-affine input: [rows, d_model]
    pub x_hat: Vec<f32>,
    /// 1/sqrt(var + eps) per row: [rows]
    pub inv_std: Vec<f32>,
}

/// Per-layer activations.
#[derive(Clone, Debug)]
pub struct LayerCache {
    pub ln1: NormCache,
    /// Attention block input after normalization: [rows, d_model]
    pub normed1: Vec<f32>,
    /// Projections: [rows, n_heads * d_head]
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    /// Softmax weights: [batch, n_heads, seq_len, seq_len]
    pub attn_weights: Vec<f32>,
    /// Concatenated head outputs before W_O: [rows, n_heads * d_head]
    pub z: Vec<f32>,
    pub ln2: NormCache,
    /// MLP input after normalization: [rows, d_model] (empty when attn_only)
    pub normed2: Vec<f32>,
    /// Pre-activation hidden: [rows, d_mlp]
    pub mlp_pre: Vec<f32>,
    /// Post-activation hidden: [rows, d_mlp]
    pub mlp_post: Vec<f32>,
}

/// All intermediate activations from a forward pass, needed for backward.
#[derive(Clone, Debug)]
pub struct ForwardCache {
    pub tokens: Vec<usize>,
    pub batch: usize,
    pub seq_len: usize,
    pub layers: Vec<LayerCache>,
    pub ln_final: NormCache,
    /// Unembedding input: [rows, d_model]
    pub normed_final: Vec<f32>,
}

/// Normalize `x` into a fresh buffer, or pass it through unchanged.
fn normalize(
    cfg: &TransformerConfig,
    x: &[f32],
    w: &[f32],
    b: &[f32],
    rows: usize,
) -> (Vec<f32>, NormCache) {
    if !cfg.has_norm() {
        return (x.to_vec(), NormCache::default());
    }
    let d = cfg.d_model;
    let mut out = vec![0.0f32; rows * d];
    let mut cache = NormCache { x_hat: vec![0.0f32; rows * d], inv_std: vec![0.0f32; rows] };
    layer_norm_f32(x, w, b, &mut out, &mut cache.x_hat, &mut cache.inv_std, rows, d);
    (out, cache)
}

/// `out = x @ w + bias` for a `[rows, k] @ [k, n]` product.
fn affine(x: &[f32], w: &[f32], bias: &[f32], rows: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * n];
    matmul_f32(x, w, &mut out, rows, k, n);
    add_bias_rows(&mut out, bias, rows, n);
    out
}

pub(crate) fn activate(act: ActFn, x: f32) -> f32 {
    match act {
        ActFn::Gelu => gelu_f32(x),
        ActFn::Relu => x.max(0.0),
    }
}

/// Run the full forward pass. The batch must already be checked against
/// the vocabulary and context length.
pub fn forward(
    params: &TransformerParams,
    cfg: &TransformerConfig,
    batch: &TokenBatch,
) -> (Logits, ForwardCache) {
    let bsz = batch.batch_size();
    let s = batch.seq_len();
    let rows = bsz * s;
    let d = cfg.d_model;
    let a = cfg.d_attn();
    let nh = cfg.n_heads;
    let hd = cfg.d_head;
    let v = cfg.d_vocab;
    let tokens = batch.as_slice().to_vec();

    // Stage 1: token + positional embedding
    let mut resid = vec![0.0f32; rows * d];
    for (r, &tok) in tokens.iter().enumerate() {
        let pos = r % s;
        let te = &params.w_embed[tok * d..(tok + 1) * d];
        let pe = &params.w_pos[pos * d..(pos + 1) * d];
        for ((out, t), p) in resid[r * d..(r + 1) * d].iter_mut().zip(te).zip(pe) {
            *out = t + p;
        }
    }

    // Stage 2: blocks
    let mut layers = Vec::with_capacity(cfg.n_layers);
    for lp in &params.layers {
        let (normed1, ln1) = normalize(cfg, &resid, &lp.ln1_w, &lp.ln1_b, rows);
        let q = affine(&normed1, &lp.w_q, &lp.b_q, rows, d, a);
        let k = affine(&normed1, &lp.w_k, &lp.b_k, rows, d, a);
        let vv = affine(&normed1, &lp.w_v, &lp.b_v, rows, d, a);

        let mut z = vec![0.0f32; rows * a];
        let mut attn_weights = vec![0.0f32; bsz * nh * s * s];
        for b in 0..bsz {
            let span = b * s * a..(b + 1) * s * a;
            let aw_span = b * nh * s * s..(b + 1) * nh * s * s;
            causal_attention_forward(
                &q[span.clone()], &k[span.clone()], &vv[span.clone()],
                &mut z[span], &mut attn_weights[aw_span],
                s, nh, hd,
            );
        }

        let attn_out = affine(&z, &lp.w_o, &lp.b_o, rows, a, d);
        for (r, o) in resid.iter_mut().zip(&attn_out) {
            *r += o;
        }

        let mut cache = LayerCache {
            ln1, normed1, q, k, v: vv, attn_weights, z,
            ln2: NormCache::default(),
            normed2: Vec::new(),
            mlp_pre: Vec::new(),
            mlp_post: Vec::new(),
        };

        if !cfg.attn_only {
            let m = cfg.d_mlp;
            let (normed2, ln2) = normalize(cfg, &resid, &lp.ln2_w, &lp.ln2_b, rows);
            let mlp_pre = affine(&normed2, &lp.w_in, &lp.b_in, rows, d, m);
            let mlp_post: Vec<f32> = mlp_pre.iter().map(|&x| activate(cfg.act_fn, x)).collect();
            let mlp_out = affine(&mlp_post, &lp.w_out, &lp.b_out, rows, m, d);
            for (r, o) in resid.iter_mut().zip(&mlp_out) {
                *r += o;
            }
            cache.ln2 = ln2;
            cache.normed2 = normed2;
            cache.mlp_pre = mlp_pre;
            cache.mlp_post = mlp_post;
        }
        layers.push(cache);
    }

    // Stage 3: final norm + unembed
    let (normed_final, ln_final) =
        normalize(cfg, &resid, &params.ln_final_w, &params.ln_final_b, rows);
    let logits = affine(&normed_final, &params.w_unembed, &params.b_unembed, rows, d, v);

    let cache = ForwardCache { tokens, batch: bsz, seq_len: s, layers, ln_final, normed_final };
    (Logits::new(logits, bsz, s, v), cache)
}
