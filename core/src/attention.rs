/// Causal multi-head attention, Rust reference implementation.
///
/// Q/K/V are [seq_len, num_heads * head_dim], split into heads internally.
/// Query position t attends to key positions 0..=t.
/// The scale factor is 1/sqrt(head_dim).

use crate::tensor::softmax_f32;

/// Causal attention forward.
///
/// Output:
///   out: [seq_len, num_heads * head_dim]
///   attn_weights: [num_heads, seq_len, seq_len] softmax weights (zero above
///   the diagonal), kept for backward.
pub fn causal_attention_forward(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    attn_weights: &mut [f32],
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
) {
    let total_dim = num_heads * head_dim;
    debug_assert_eq!(q.len(), seq_len * total_dim);
    debug_assert_eq!(k.len(), seq_len * total_dim);
    debug_assert_eq!(v.len(), seq_len * total_dim);
    debug_assert_eq!(out.len(), seq_len * total_dim);
    debug_assert_eq!(attn_weights.len(), num_heads * seq_len * seq_len);

    let scale = 1.0 / (head_dim as f32).sqrt();

    for x in out.iter_mut() { *x = 0.0; }
    for x in attn_weights.iter_mut() { *x = 0.0; }

    let mut scores = vec![f32::NEG_INFINITY; seq_len];
    for h in 0..num_heads {
        let h_offset = h * head_dim;

        for q_pos in 0..seq_len {
            for s in scores.iter_mut() { *s = f32::NEG_INFINITY; }
            for k_pos in 0..=q_pos {
                let mut dot = 0.0f32;
                for d in 0..head_dim {
                    dot += q[q_pos * total_dim + h_offset + d]
                         * k[k_pos * total_dim + h_offset + d];
                }
                scores[k_pos] = dot * scale;
            }

            let aw_base = (h * seq_len + q_pos) * seq_len;
            softmax_f32(&scores, &mut attn_weights[aw_base..aw_base + seq_len], 1, seq_len);

            for k_pos in 0..=q_pos {
                let weight = attn_weights[aw_base + k_pos];
                for d in 0..head_dim {
                    out[q_pos * total_dim + h_offset + d] +=
                        weight * v[k_pos * total_dim + h_offset + d];
                }
            }
        }
    }
}

/// Causal attention backward.
///
/// Accumulates dQ, dK, dV from d_out and the cached weights/Q/K/V.
pub fn causal_attention_backward(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    attn_weights: &[f32],
    d_out: &[f32],
    d_q: &mut [f32],
    d_k: &mut [f32],
    d_v: &mut [f32],
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
) {
    let total_dim = num_heads * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut d_attn_w = vec![0.0f32; seq_len];

    for h in 0..num_heads {
        let h_offset = h * head_dim;

        for q_pos in 0..seq_len {
            let aw_base = (h * seq_len + q_pos) * seq_len;

            // d_attn_w[k] = sum_d d_out[q,h,d] * V[k,h,d]
            for k_pos in 0..=q_pos {
                let mut sum = 0.0f32;
                for dd in 0..head_dim {
                    sum += d_out[q_pos * total_dim + h_offset + dd]
                         * v[k_pos * total_dim + h_offset + dd];
                }
                d_attn_w[k_pos] = sum;
            }

            // d_V[k,h,d] += P[q,k] * d_out[q,h,d]
            for k_pos in 0..=q_pos {
                let aw = attn_weights[aw_base + k_pos];
                for dd in 0..head_dim {
                    d_v[k_pos * total_dim + h_offset + dd] +=
                        aw * d_out[q_pos * total_dim + h_offset + dd];
                }
            }

            // Softmax backward: d_scores[i] = P[i] * (d_attn_w[i] - sum_j(P[j] * d_attn_w[j]))
            let mut dot_pw = 0.0f32;
            for k_pos in 0..=q_pos {
                dot_pw += attn_weights[aw_base + k_pos] * d_attn_w[k_pos];
            }

            for k_pos in 0..=q_pos {
                let ds = attn_weights[aw_base + k_pos] * (d_attn_w[k_pos] - dot_pw) * scale;
                for dd in 0..head_dim {
                    d_q[q_pos * total_dim + h_offset + dd] +=
                        ds * k[k_pos * total_dim + h_offset + dd];
                    d_k[k_pos * total_dim + h_offset + dd] +=
                        ds * q[q_pos * total_dim + h_offset + dd];
                }
            }
        }
    }
}
