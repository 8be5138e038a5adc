//! Batch streams: infinite producers of fixed-length token rows.
//!
//! Two backends share the `BatchStream` trait:
//!   SampleStream:  `[true, x, y, equal, z]` drawn from the true cells of a mask
//!   LinkageStream: `[define, define, g*m + i, equal, (1-g)*m + i]`
//!
//! Every call is self-contained; the only state carried between calls is the
//! stream's own random source.

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::error::{ConfigError, ShapeError};
use crate::table::{CoordGrids, Mask};
use crate::vocab::{Special, Vocab};

/// Every sample is five tokens long: `[prefix, a, b, equal, answer]`.
pub const SEQ_LEN: usize = 5;

// ── Types ──────────────────────────────────────────────────────────────

/// Row-major `[batch_size, seq_len]` block of token ids.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenBatch {
    tokens: Vec<usize>,
    batch_size: usize,
    seq_len: usize,
}

impl TokenBatch {
    pub fn new(tokens: Vec<usize>, seq_len: usize) -> Result<Self, ShapeError> {
        if seq_len == 0 || tokens.is_empty() {
            return Err(ShapeError::EmptyBatch);
        }
        if tokens.len() % seq_len != 0 {
            return Err(ShapeError::RaggedBatch { len: tokens.len(), seq_len });
        }
        Ok(TokenBatch { batch_size: tokens.len() / seq_len, tokens, seq_len })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn row(&self, b: usize) -> &[usize] {
        &self.tokens[b * self.seq_len..(b + 1) * self.seq_len]
    }

    pub fn rows(&self) -> std::slice::ChunksExact<'_, usize> {
        self.tokens.chunks_exact(self.seq_len)
    }

    /// Token at `pos` for every row.
    pub fn column(&self, pos: usize) -> Vec<usize> {
        self.rows().map(|r| r[pos]).collect()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.tokens
    }
}

// ── Trait ───────────────────────────────────────────────────────────────

/// Infinite batch producer. Object-safe for `&mut dyn BatchStream`.
pub trait BatchStream {
    /// Draw the next batch. Never exhausts.
    fn next_batch(&mut self) -> TokenBatch;

    fn batch_size(&self) -> usize;
}

// ── SampleStream ───────────────────────────────────────────────────────

/// Operation samples drawn uniformly, with replacement, from mask-true cells.
pub struct SampleStream {
    batch_size: usize,
    prefix: usize,
    equal: usize,
    /// (x, y, z) ids of every selectable cell.
    cells: Vec<(usize, usize, usize)>,
    rng: StdRng,
}

impl SampleStream {
    /// `coords` must already be in the id space the stream should emit
    /// (use `CoordGrids::offset` for aliases). `label` names the stream in
    /// the degenerate-mask error.
    pub fn new(
        batch_size: usize,
        coords: &CoordGrids,
        mask: &Mask,
        vocab: Vocab,
        rng: StdRng,
        label: &'static str,
    ) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        let (x, y, z) = (coords.x.as_slice(), coords.y.as_slice(), coords.z.as_slice());
        let cells: Vec<(usize, usize, usize)> = mask
            .true_indices()
            .into_iter()
            .map(|i| (x[i], y[i], z[i]))
            .collect();
        if cells.is_empty() {
            return Err(ConfigError::DegenerateMask(label));
        }
        Ok(SampleStream {
            batch_size,
            prefix: vocab.special(Special::True),
            equal: vocab.special(Special::Equal),
            cells,
            rng,
        })
    }

    pub fn seeded(
        batch_size: usize,
        coords: &CoordGrids,
        mask: &Mask,
        vocab: Vocab,
        seed: u64,
        label: &'static str,
    ) -> Result<Self, ConfigError> {
        Self::new(batch_size, coords, mask, vocab, StdRng::seed_from_u64(seed), label)
    }

    /// Number of distinct cells this stream can emit.
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

impl BatchStream for SampleStream {
    fn next_batch(&mut self) -> TokenBatch {
        let mut tokens = Vec::with_capacity(self.batch_size * SEQ_LEN);
        for _ in 0..self.batch_size {
            let (x, y, z) = self.cells[self.rng.random_range(0..self.cells.len())];
            tokens.extend_from_slice(&[self.prefix, x, y, self.equal, z]);
        }
        TokenBatch { tokens, batch_size: self.batch_size, seq_len: SEQ_LEN }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

// ── LinkageStream ──────────────────────────────────────────────────────

/// Define-statements tying each original id to its alias, in either direction.
pub struct LinkageStream {
    batch_size: usize,
    modulus: usize,
    define: usize,
    equal: usize,
    rng: StdRng,
}

impl LinkageStream {
    pub fn new(batch_size: usize, vocab: Vocab, rng: StdRng) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(LinkageStream {
            batch_size,
            modulus: vocab.modulus(),
            define: vocab.special(Special::Define),
            equal: vocab.special(Special::Equal),
            rng,
        })
    }

    pub fn seeded(batch_size: usize, vocab: Vocab, seed: u64) -> Result<Self, ConfigError> {
        Self::new(batch_size, vocab, StdRng::seed_from_u64(seed))
    }
}

impl BatchStream for LinkageStream {
    fn next_batch(&mut self) -> TokenBatch {
        let m = self.modulus;
        let mut tokens = Vec::with_capacity(self.batch_size * SEQ_LEN);
        for _ in 0..self.batch_size {
            let i = self.rng.random_range(0..m);
            let g = self.rng.random_range(0..2usize);
            tokens.extend_from_slice(&[self.define, self.define, g * m + i, self.equal, (1 - g) * m + i]);
        }
        TokenBatch { tokens, batch_size: self.batch_size, seq_len: SEQ_LEN }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

// ── Unit tests ─────────────────────────────────────────────────────────
