/// Attention-based sequence model: configuration and parameters.
///
/// Pre-norm transformer with learned positional embeddings. Each layer is a
/// causal multi-head attention block and, unless `attn_only`, an MLP block,
/// both residual. All weight matrices are flat Vec<f32> in row-major layout,
/// stored `[in, out]`.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Serialize, Deserialize};

use crate::backward::backward;
use crate::error::{ConfigError, ShapeError};
use crate::forward::{forward, ForwardCache, Logits};
use crate::stream::{TokenBatch, SEQ_LEN};
use crate::tensor::fill_uniform;

/// MLP nonlinearity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActFn {
    /// tanh approximation
    Gelu,
    Relu,
}

/// Normalization applied before each block and before unembedding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    #[serde(rename = "LN")]
    LayerNorm,
    #[serde(rename = "none")]
    Identity,
}

/// Model configuration, immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub d_vocab: usize,
    pub n_layers: usize,
    pub d_model: usize,
    pub d_head: usize,
    pub n_heads: usize,
    pub d_mlp: usize,
    pub n_ctx: usize,
    pub act_fn: ActFn,
    pub normalization_type: NormKind,
    pub attn_only: bool,
}

impl Default for TransformerConfig {
    /// Two attention-only layers: the first can learn the alias replacement,
    /// the second the table lookup. `d_vocab` is overwritten by the driver.
    fn default() -> Self {
        TransformerConfig {
            d_vocab: 512,
            n_layers: 2,
            d_model: 128,
            d_head: 128,
            n_heads: 4,
            d_mlp: 256,
            n_ctx: SEQ_LEN,
            act_fn: ActFn::Gelu,
            normalization_type: NormKind::LayerNorm,
            attn_only: true,
        }
    }
}

impl TransformerConfig {
    /// Tiny configuration for fast tests.
    pub fn test_config(d_vocab: usize) -> Self {
        TransformerConfig {
            d_vocab,
            n_layers: 2,
            d_model: 16,
            d_head: 8,
            n_heads: 2,
            d_mlp: 32,
            n_ctx: SEQ_LEN,
            act_fn: ActFn::Gelu,
            normalization_type: NormKind::LayerNorm,
            attn_only: true,
        }
    }

    pub fn with_vocab(mut self, d_vocab: usize) -> Self {
        self.d_vocab = d_vocab;
        self
    }

    /// Width of the concatenated heads.
    pub fn d_attn(&self) -> usize {
        self.n_heads * self.d_head
    }

    pub fn has_norm(&self) -> bool {
        self.normalization_type == NormKind::LayerNorm
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let dims = [
            ("d_vocab", self.d_vocab),
            ("n_layers", self.n_layers),
            ("d_model", self.d_model),
            ("d_head", self.d_head),
            ("n_heads", self.n_heads),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(ConfigError::InvalidArchitecture(format!("{name} must be at least 1")));
            }
        }
        if !self.attn_only && self.d_mlp == 0 {
            return Err(ConfigError::InvalidArchitecture("d_mlp must be at least 1 with an MLP".into()));
        }
        if self.n_ctx < SEQ_LEN {
            return Err(ConfigError::InvalidArchitecture(format!(
                "n_ctx={} is shorter than the {SEQ_LEN}-token samples", self.n_ctx
            )));
        }
        Ok(())
    }
}

/// Per-layer weights.
///
/// Layout (row-major):
///   ln1_w, ln1_b:  [d_model]          (empty without normalization)
///   w_q, w_k, w_v: [d_model, d_attn]
///   b_q, b_k, b_v: [d_attn]
///   w_o:           [d_attn, d_model]
///   b_o:           [d_model]
///   ln2_w, ln2_b:  [d_model]          (empty when attn_only or no normalization)
///   w_in:          [d_model, d_mlp]   (empty when attn_only)
///   b_in:          [d_mlp]
///   w_out:         [d_mlp, d_model]
///   b_out:         [d_model]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub ln1_w: Vec<f32>,
    pub ln1_b: Vec<f32>,
    pub w_q: Vec<f32>,
    pub b_q: Vec<f32>,
    pub w_k: Vec<f32>,
    pub b_k: Vec<f32>,
    pub w_v: Vec<f32>,
    pub b_v: Vec<f32>,
    pub w_o: Vec<f32>,
    pub b_o: Vec<f32>,
    pub ln2_w: Vec<f32>,
    pub ln2_b: Vec<f32>,
    pub w_in: Vec<f32>,
    pub b_in: Vec<f32>,
    pub w_out: Vec<f32>,
    pub b_out: Vec<f32>,
}

impl LayerParams {
    fn zeros(cfg: &TransformerConfig) -> Self {
        let d = cfg.d_model;
        let a = cfg.d_attn();
        let norm = if cfg.has_norm() { d } else { 0 };
        let norm2 = if cfg.attn_only { 0 } else { norm };
        let mlp = if cfg.attn_only { 0 } else { cfg.d_mlp };
        let mlp_d = if cfg.attn_only { 0 } else { d };
        LayerParams {
            ln1_w: vec![0.0; norm],
            ln1_b: vec![0.0; norm],
            w_q: vec![0.0; d * a],
            b_q: vec![0.0; a],
            w_k: vec![0.0; d * a],
            b_k: vec![0.0; a],
            w_v: vec![0.0; d * a],
            b_v: vec![0.0; a],
            w_o: vec![0.0; a * d],
            b_o: vec![0.0; d],
            ln2_w: vec![0.0; norm2],
            ln2_b: vec![0.0; norm2],
            w_in: vec![0.0; mlp_d * mlp],
            b_in: vec![0.0; mlp],
            w_out: vec![0.0; mlp * mlp_d],
            b_out: vec![0.0; mlp_d],
        }
    }

    fn init(cfg: &TransformerConfig, rng: &mut StdRng) -> Self {
        let mut p = LayerParams::zeros(cfg);
        let d = cfg.d_model as f32;
        let a = cfg.d_attn() as f32;
        let qkv_scale = (1.0 / d).sqrt();
        let o_scale = (1.0 / a).sqrt();
        fill_uniform(rng, &mut p.w_q, qkv_scale);
        fill_uniform(rng, &mut p.w_k, qkv_scale);
        fill_uniform(rng, &mut p.w_v, qkv_scale);
        fill_uniform(rng, &mut p.w_o, o_scale);
        if !p.w_in.is_empty() {
            let m = cfg.d_mlp as f32;
            fill_uniform(rng, &mut p.w_in, (2.0 / (d + m)).sqrt());
            fill_uniform(rng, &mut p.w_out, (2.0 / (d + m)).sqrt());
        }
        p.ln1_w.fill(1.0);
        p.ln2_w.fill(1.0);
        p
    }

    fn buffers(&self) -> [&[f32]; 16] {
        [
            &self.ln1_w[..], &self.ln1_b[..],
            &self.w_q[..], &self.b_q[..], &self.w_k[..], &self.b_k[..], &self.w_v[..], &self.b_v[..],
            &self.w_o[..], &self.b_o[..],
            &self.ln2_w[..], &self.ln2_b[..],
            &self.w_in[..], &self.b_in[..], &self.w_out[..], &self.b_out[..],
        ]
    }

    fn buffers_mut(&mut self) -> [&mut [f32]; 16] {
        [
            &mut self.ln1_w[..], &mut self.ln1_b[..],
            &mut self.w_q[..], &mut self.b_q[..], &mut self.w_k[..], &mut self.b_k[..],
            &mut self.w_v[..], &mut self.b_v[..],
            &mut self.w_o[..], &mut self.b_o[..],
            &mut self.ln2_w[..], &mut self.ln2_b[..],
            &mut self.w_in[..], &mut self.b_in[..], &mut self.w_out[..], &mut self.b_out[..],
        ]
    }
}

/// All learnable parameters.
///
/// Layout (row-major):
///   w_embed:     [d_vocab, d_model]
///   w_pos:       [n_ctx, d_model]
///   layers:      n_layers x LayerParams
///   ln_final_w/b:[d_model]           (empty without normalization)
///   w_unembed:   [d_model, d_vocab]
///   b_unembed:   [d_vocab]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformerParams {
    pub w_embed: Vec<f32>,
    pub w_pos: Vec<f32>,
    pub layers: Vec<LayerParams>,
    pub ln_final_w: Vec<f32>,
    pub ln_final_b: Vec<f32>,
    pub w_unembed: Vec<f32>,
    pub b_unembed: Vec<f32>,
}

impl TransformerParams {
    /// Initialize with small random values using Xavier-like scaling.
    pub fn init(cfg: &TransformerConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut p = TransformerParams::zeros_like(cfg);
        let d = cfg.d_model as f32;

        fill_uniform(&mut rng, &mut p.w_embed, (1.0 / d).sqrt());
        fill_uniform(&mut rng, &mut p.w_pos, (1.0 / d).sqrt());
        p.layers = (0..cfg.n_layers).map(|_| LayerParams::init(cfg, &mut rng)).collect();
        p.ln_final_w.fill(1.0);
        fill_uniform(&mut rng, &mut p.w_unembed, (1.0 / d).sqrt());
        p
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(cfg: &TransformerConfig) -> Self {
        let d = cfg.d_model;
        let v = cfg.d_vocab;
        let norm = if cfg.has_norm() { d } else { 0 };
        TransformerParams {
            w_embed: vec![0.0; v * d],
            w_pos: vec![0.0; cfg.n_ctx * d],
            layers: (0..cfg.n_layers).map(|_| LayerParams::zeros(cfg)).collect(),
            ln_final_w: vec![0.0; norm],
            ln_final_b: vec![0.0; norm],
            w_unembed: vec![0.0; d * v],
            b_unembed: vec![0.0; v],
        }
    }

    /// Every parameter buffer in a fixed order (optimizer state follows it).
    pub fn buffers(&self) -> Vec<&[f32]> {
        let mut out: Vec<&[f32]> = vec![&self.w_embed[..], &self.w_pos[..]];
        for layer in &self.layers {
            out.extend(layer.buffers());
        }
        out.extend([&self.ln_final_w[..], &self.ln_final_b[..], &self.w_unembed[..], &self.b_unembed[..]]);
        out
    }

    /// Mutable counterpart of `buffers`, same order.
    pub fn buffers_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out: Vec<&mut [f32]> = vec![&mut self.w_embed[..], &mut self.w_pos[..]];
        for layer in self.layers.iter_mut() {
            out.extend(layer.buffers_mut());
        }
        out.extend([
            &mut self.ln_final_w[..], &mut self.ln_final_b[..],
            &mut self.w_unembed[..], &mut self.b_unembed[..],
        ]);
        out
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.buffers().iter().map(|b| b.len()).sum()
    }

    /// Global L2 norm over every buffer.
    pub fn global_norm(&self) -> f32 {
        self.buffers()
            .iter()
            .flat_map(|b| b.iter())
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale(&mut self, factor: f32) {
        for buf in self.buffers_mut() {
            for x in buf.iter_mut() {
                *x *= factor;
            }
        }
    }

    pub fn zero(&mut self) {
        for buf in self.buffers_mut() {
            buf.fill(0.0);
        }
    }
}

/// Model instance: configuration plus the weights a training run mutates.
#[derive(Clone, Debug)]
pub struct Transformer {
    pub cfg: TransformerConfig,
    pub params: TransformerParams,
}

impl Transformer {
    /// Fresh randomly initialized model. The config must already be valid.
    pub fn new(cfg: TransformerConfig, seed: u64) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let params = TransformerParams::init(&cfg, seed);
        Ok(Transformer { cfg, params })
    }

    pub fn from_parts(cfg: TransformerConfig, params: TransformerParams) -> Self {
        Transformer { cfg, params }
    }

    /// Check that every token fits the vocabulary and every row the context.
    pub fn check_batch(&self, batch: &TokenBatch) -> Result<(), ShapeError> {
        if batch.seq_len() > self.cfg.n_ctx {
            return Err(ShapeError::ContextOverflow { seq_len: batch.seq_len(), n_ctx: self.cfg.n_ctx });
        }
        if let Some(&token) = batch.as_slice().iter().find(|&&t| t >= self.cfg.d_vocab) {
            return Err(ShapeError::TokenOutOfRange { token, vocab_size: self.cfg.d_vocab });
        }
        Ok(())
    }

    /// Forward pass keeping every activation backward needs.
    pub fn forward(&self, batch: &TokenBatch) -> Result<(Logits, ForwardCache), ShapeError> {
        self.check_batch(batch)?;
        Ok(forward(&self.params, &self.cfg, batch))
    }

    /// Forward pass for evaluation only.
    pub fn logits(&self, batch: &TokenBatch) -> Result<Logits, ShapeError> {
        self.forward(batch).map(|(logits, _)| logits)
    }

    /// Accumulate parameter gradients of a scalar objective into `grads`,
    /// given its gradient w.r.t. the logits of `cache`'s forward pass.
    pub fn backward(&self, cache: &ForwardCache, d_logits: &[f32], grads: &mut TransformerParams) {
        backward(&self.params, &self.cfg, cache, d_logits, grads);
    }

    pub fn zero_grads(&self) -> TransformerParams {
        TransformerParams::zeros_like(&self.cfg)
    }
}
