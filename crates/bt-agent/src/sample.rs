// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::{PureResult, Tensor, TensorError};
use rand::Rng;

/// One stochastic decision point in the computation graph.
///
/// Carries the sampled action per batch row, a detached copy for control
/// flow, and the full probability rows the sample was drawn under. The
/// probabilities are what a score-function (REINFORCE) trainer differentiates;
/// the detached copy is what gets fed back into the graph without creating a
/// gradient path through the sampling itself.
#[derive(Clone, Debug)]
pub struct SampleNode {
    indices: Vec<usize>,
    value: Tensor,
    detached: Tensor,
    dist: Tensor,
}

impl SampleNode {
    /// Wraps sampled indices together with the distribution they came from.
    pub fn new(indices: Vec<usize>, dist: Tensor) -> PureResult<Self> {
        let (batch, width) = dist.shape();
        if indices.len() != batch {
            return Err(TensorError::DataLength {
                expected: batch,
                got: indices.len(),
            });
        }
        if let Some(&bad) = indices.iter().find(|&&idx| idx >= width) {
            return Err(TensorError::TokenOutOfRange {
                token: bad as f32,
                vocab: width,
            });
        }
        let value = Tensor::from_vec(batch, 1, indices.iter().map(|&i| i as f32).collect())?;
        let detached = value.clone();
        Ok(Self {
            indices,
            value,
            detached,
            dist,
        })
    }

    /// Sampled action index per batch row.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Sampled values as a `(batch, 1)` tensor on the gradient path.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Detached copy of the sampled values for control-flow use.
    pub fn detached(&self) -> &Tensor {
        &self.detached
    }

    /// Probability rows the sample was drawn under, `(batch, width)`.
    pub fn dist(&self) -> &Tensor {
        &self.dist
    }

    /// Probability mass of the action actually drawn for batch row `b`.
    pub fn prob_of_sample(&self, b: usize) -> PureResult<f32> {
        if b >= self.indices.len() {
            return Err(TensorError::InvalidValue {
                label: "sample batch row out of range",
            });
        }
        Ok(self.dist.row(b)[self.indices[b]])
    }
}

/// Draws one index from a normalised probability row.
pub(crate) fn sample_categorical<R: Rng>(probs: &[f32], rng: &mut R) -> usize {
    let draw: f32 = rng.gen();
    let mut acc = 0.0f32;
    for (idx, &p) in probs.iter().enumerate() {
        acc += p;
        if draw < acc {
            return idx;
        }
    }
    probs.len() - 1
}
