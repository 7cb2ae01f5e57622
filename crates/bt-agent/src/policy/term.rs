// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::policy::ENTROPY_EPS;
use crate::sample::SampleNode;
use crate::{PureResult, Tensor, TensorError};
use bt_nn::{Linear, Module};
use rand::Rng;

fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Maps the shared hidden state to a per-example stop probability and samples
/// a Bernoulli termination decision.
pub struct TermPolicy {
    h1: Linear,
}

impl TermPolicy {
    pub fn new(embedding_size: usize) -> PureResult<Self> {
        Ok(Self {
            h1: Linear::new("term_policy::h1", embedding_size, 1)?,
        })
    }

    pub fn gaussian<R: Rng>(embedding_size: usize, rng: &mut R) -> PureResult<Self> {
        Ok(Self {
            h1: Linear::gaussian("term_policy::h1", embedding_size, 1, rng)?,
        })
    }

    /// Samples one stop/continue decision per batch row.
    ///
    /// Returns the sample node (distribution rows are `[p_continue, p_stop]`)
    /// and the batch-summed entropy `-Σ p·ln(p + ε)`.
    pub fn forward<R: Rng>(&self, hidden: &Tensor, rng: &mut R) -> PureResult<(SampleNode, f32)> {
        let logits = self.h1.forward(hidden)?;
        let batch = logits.shape().0;
        let mut dist = Vec::with_capacity(batch * 2);
        let mut indices = Vec::with_capacity(batch);
        let mut entropy = 0.0f32;
        for b in 0..batch {
            let p_stop = sigmoid(logits.row(b)[0]);
            let draw: f32 = rng.gen();
            indices.push(usize::from(draw < p_stop));
            dist.push(1.0 - p_stop);
            dist.push(p_stop);
            entropy -= p_stop * (p_stop + ENTROPY_EPS).ln();
        }
        let node = SampleNode::new(indices, Tensor::from_vec(batch, 2, dist)?)?;
        Ok((node, entropy))
    }

    /// Accumulates the score-function gradient of the surrogate loss
    /// `-Σ_b w_b · ln π(a_b)` and returns the gradient with respect to the
    /// hidden state.
    pub fn backward(
        &mut self,
        hidden: &Tensor,
        node: &SampleNode,
        weights: &[f32],
    ) -> PureResult<Tensor> {
        let batch = hidden.shape().0;
        if weights.len() != batch {
            return Err(TensorError::DataLength {
                expected: batch,
                got: weights.len(),
            });
        }
        let mut grad_logits = Vec::with_capacity(batch);
        for b in 0..batch {
            let p_stop = node.dist().row(b)[1];
            let action = node.indices()[b] as f32;
            grad_logits.push((p_stop - action) * weights[b]);
        }
        let grad_logits = Tensor::from_vec(batch, 1, grad_logits)?;
        self.h1.backward(hidden, &grad_logits)
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.h1.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.h1.visit_parameters_mut(visitor)
    }
}
