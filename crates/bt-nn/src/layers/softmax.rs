// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::{PureResult, Tensor};

/// Row-wise softmax with max subtraction for numeric stability.
///
/// Rows whose exponentials collapse to a non-finite or zero sum fall back to
/// the uniform distribution so downstream sampling always sees a valid
/// probability row.
pub fn softmax_rows(input: &Tensor) -> PureResult<Tensor> {
    let (rows, cols) = input.shape();
    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let row = input.row(r);
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        if !sum.is_finite() || sum <= 0.0 {
            let uniform = 1.0 / cols as f32;
            out.extend(std::iter::repeat(uniform).take(cols));
            continue;
        }
        let inv = 1.0 / sum;
        for value in exps.iter_mut() {
            *value *= inv;
        }
        out.extend(exps);
    }
    Tensor::from_vec(rows, cols, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let input = Tensor::from_vec(2, 3, vec![1.0, 0.0, -1.0, 0.5, -0.25, 0.75]).unwrap();
        let probs = softmax_rows(&input).unwrap();
        for r in 0..2 {
            let sum: f32 = probs.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(probs.row(r).iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn softmax_handles_extreme_logits() {
        let input = Tensor::from_vec(1, 3, vec![1000.0, -1000.0, 0.0]).unwrap();
        let probs = softmax_rows(&input).unwrap();
        assert!(probs.data().iter().all(|p| p.is_finite()));
        assert!((probs.data()[0] - 1.0).abs() < 1e-5);
    }
}
