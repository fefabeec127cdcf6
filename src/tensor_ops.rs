//! Tensor primitives consumed by the driver: softmax, log-softmax, column
//! gather, max and logsumexp. These are thin wrappers over `candle_core`/
//! `candle_nn`, grounded in the same calls the teacher already makes
//! (`candle_nn::ops::softmax`, `Tensor::i`, `to_vec1`) and generalized to
//! operate over a batch of rows instead of one sequence at a time.

use candle_core::{IndexOp, Tensor};

/// Softmax over the last axis.
pub fn softmax_last_dim(logits: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::softmax(logits, candle_core::D::Minus1)
}

/// Log-softmax over the last axis.
pub fn log_softmax_last_dim(logits: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::log_softmax(logits, candle_core::D::Minus1)
}

/// Gathers a single vocabulary column out of a `[N, V]` logits tensor,
/// returning a length-`N` vector on the host.
pub fn gather_column_f32(logits: &Tensor, column: usize) -> candle_core::Result<Vec<f32>> {
    logits.i((.., column))?.to_dtype(candle_core::DType::F32)?.to_vec1()
}

/// Best (highest) log-probability in `row[range]`.
///
/// Returns `f32::NEG_INFINITY` for an empty range, so callers comparing it
/// against a mass term never spuriously prefer an empty side.
pub fn max_over_range(row: &[f32], range: std::ops::Range<usize>) -> f32 {
    row.get(range)
        .into_iter()
        .flatten()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max)
}

/// `log(sum(exp(row[range])))`, computed with the standard max-subtraction
/// trick for numerical stability. Returns `f32::NEG_INFINITY` for an empty
/// range (mass of nothing is zero probability).
pub fn logsumexp_over_range(row: &[f32], range: std::ops::Range<usize>) -> f32 {
    let slice = match row.get(range) {
        Some(s) if !s.is_empty() => s,
        _ => return f32::NEG_INFINITY,
    };
    let m = slice.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !m.is_finite() {
        return m;
    }
    let sum: f32 = slice.iter().map(|&x| (x - m).exp()).sum();
    m + sum.ln()
}
