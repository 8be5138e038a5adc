/// Tensor utilities for the reference transformer.
///
/// All operations are free functions on flat f32 slices with explicit dimensions.
/// Row-major layout throughout. Weight matrices are stored `[in, out]` so a
/// linear layer is `Y[s, out] = X[s, in] @ W[in, out] + b`.

use rand::Rng;

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// C[M,K] += A[M,N] @ B[K,N]^T. Input gradient of a linear layer: dX += dY @ W^T.
pub fn matmul_nt_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, n: usize, k: usize) {
    debug_assert_eq!(a.len(), m * n);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * k);

    for i in 0..m {
        let a_row = &a[i * n..(i + 1) * n];
        for j in 0..k {
            let b_row = &b[j * n..(j + 1) * n];
            let mut sum = 0.0f32;
            for p in 0..n {
                sum += a_row[p] * b_row[p];
            }
            out[i * k + j] += sum;
        }
    }
}

/// C[K,N] += A[M,K]^T @ B[M,N]. Weight gradient of a linear layer: dW += X^T @ dY.
pub fn matmul_tn_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), m * n);
    debug_assert_eq!(out.len(), k * n);

    for p in 0..m {
        let b_row = &b[p * n..(p + 1) * n];
        for i in 0..k {
            let a_pi = a[p * k + i];
            if a_pi == 0.0 {
                continue;
            }
            let out_row = &mut out[i * n..(i + 1) * n];
            for j in 0..n {
                out_row[j] += a_pi * b_row[j];
            }
        }
    }
}

/// Add `bias[cols]` to every row of `out[rows, cols]`.
pub fn add_bias_rows(out: &mut [f32], bias: &[f32], rows: usize, cols: usize) {
    debug_assert_eq!(out.len(), rows * cols);
    debug_assert_eq!(bias.len(), cols);
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] += bias[c];
        }
    }
}

/// `out[cols] += sum over rows of a[rows, cols]`. Bias gradient.
pub fn col_sum_acc(a: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(a.len(), rows * cols);
    debug_assert_eq!(out.len(), cols);
    for r in 0..rows {
        for c in 0..cols {
            out[c] += a[r * cols + c];
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// log-softmax of a single row evaluated at `index`.
pub fn log_softmax_at(row: &[f32], index: usize) -> f32 {
    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum_exp: f32 = row.iter().map(|&x| (x - max_val).exp()).sum();
    (row[index] - max_val) - sum_exp.ln()
}

/// Index of the largest element; first one wins on ties.
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &x) in row.iter().enumerate() {
        if x > row[best] {
            best = i;
        }
    }
    best
}

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// LayerNorm forward over `rows` rows of width `cols`.
///
/// Writes the affine output to `out`, the normalized input to `x_hat` and
/// `1/sqrt(var + eps)` per row to `inv_std` (both needed by backward).
pub fn layer_norm_f32(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    out: &mut [f32],
    x_hat: &mut [f32],
    inv_std: &mut [f32],
    rows: usize,
    cols: usize,
) {
    debug_assert_eq!(x.len(), rows * cols);
    debug_assert_eq!(inv_std.len(), rows);
    for r in 0..rows {
        let row = &x[r * cols..(r + 1) * cols];
        let mean = row.iter().sum::<f32>() / cols as f32;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
        let is = 1.0 / (var + LAYER_NORM_EPS).sqrt();
        inv_std[r] = is;
        for c in 0..cols {
            let h = (row[c] - mean) * is;
            x_hat[r * cols + c] = h;
            out[r * cols + c] = h * w[c] + b[c];
        }
    }
}

/// LayerNorm backward. Accumulates into `dx`, `dw`, `db`.
pub fn layer_norm_backward_f32(
    dy: &[f32],
    x_hat: &[f32],
    inv_std: &[f32],
    w: &[f32],
    dx: &mut [f32],
    dw: &mut [f32],
    db: &mut [f32],
    rows: usize,
    cols: usize,
) {
    let n = cols as f32;
    let mut d_hat = vec![0.0f32; cols];
    for r in 0..rows {
        let base = r * cols;
        let mut mean_dh = 0.0f32;
        let mut mean_dh_h = 0.0f32;
        for c in 0..cols {
            let g = dy[base + c];
            let h = x_hat[base + c];
            dw[c] += g * h;
            db[c] += g;
            d_hat[c] = g * w[c];
            mean_dh += d_hat[c];
            mean_dh_h += d_hat[c] * h;
        }
        mean_dh /= n;
        mean_dh_h /= n;
        for c in 0..cols {
            dx[base + c] += inv_std[r] * (d_hat[c] - mean_dh - x_hat[base + c] * mean_dh_h);
        }
    }
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_CUBIC: f32 = 0.044_715;

/// GELU, tanh approximation.
#[inline]
pub fn gelu_f32(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x)).tanh())
}

#[inline]
pub fn gelu_prime_f32(x: f32) -> f32 {
    let u = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
    let t = u.tanh();
    let du = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_CUBIC * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Fill slice with uniform random values in [-scale, scale].
pub fn fill_uniform<R: Rng + ?Sized>(rng: &mut R, buf: &mut [f32], scale: f32) {
    for v in buf.iter_mut() {
        *v = rng.random_range(-scale..=scale);
    }
}
