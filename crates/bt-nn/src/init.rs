// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::{PureResult, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

/// Draws a `(rows, cols)` tensor of Gaussian weights scaled by `1/sqrt(rows)`
/// so activations stay in range regardless of fan-in.
pub fn gaussian_tensor<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> PureResult<Tensor> {
    let sigma = 1.0 / (rows as f32).sqrt();
    Tensor::from_fn(rows, cols, |_r, _c| {
        let sample: f32 = rng.sample(StandardNormal);
        sample * sigma
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn gaussian_tensor_is_finite_and_scaled() {
        let mut rng = StdRng::seed_from_u64(11);
        let tensor = gaussian_tensor(100, 4, &mut rng).unwrap();
        assert_eq!(tensor.shape(), (100, 4));
        for value in tensor.data() {
            assert!(value.is_finite());
            assert!(value.abs() < 1.0);
        }
    }
}
