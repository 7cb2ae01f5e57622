// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::policy::ENTROPY_EPS;
use crate::sample::{sample_categorical, SampleNode};
use crate::{PureResult, Tensor, TensorError};
use bt_nn::{softmax_rows, Linear, Module};
use rand::Rng;

/// Per-item categorical heads over possible counts.
///
/// Each negotiable item gets its own linear head held in a fixed arena, so
/// gradients update every item's parameters independently.
pub struct ProposalPolicy {
    heads: Vec<Linear>,
    num_counts: usize,
}

impl ProposalPolicy {
    pub fn new(embedding_size: usize, num_counts: usize, num_items: usize) -> PureResult<Self> {
        let heads = (0..num_items)
            .map(|item| Linear::new(format!("proposal_policy::item{item}"), embedding_size, num_counts))
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self { heads, num_counts })
    }

    pub fn gaussian<R: Rng>(
        embedding_size: usize,
        num_counts: usize,
        num_items: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        let heads = (0..num_items)
            .map(|item| {
                Linear::gaussian(
                    format!("proposal_policy::item{item}"),
                    embedding_size,
                    num_counts,
                    rng,
                )
            })
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self { heads, num_counts })
    }

    /// Samples one count per item per batch row.
    ///
    /// Returns the per-item sample nodes, the assembled `(batch, num_items)`
    /// proposal tensor, and the entropy `-Σ (p+ε)·ln(p+ε)` accumulated over
    /// every item's distribution and the batch.
    pub fn forward<R: Rng>(
        &self,
        hidden: &Tensor,
        rng: &mut R,
    ) -> PureResult<(Vec<SampleNode>, Tensor, f32)> {
        let batch = hidden.shape().0;
        let mut nodes = Vec::with_capacity(self.heads.len());
        let mut entropy = 0.0f32;
        let mut proposal = vec![0.0f32; batch * self.heads.len()];
        for (item, head) in self.heads.iter().enumerate() {
            let probs = softmax_rows(&head.forward(hidden)?)?;
            let mut indices = Vec::with_capacity(batch);
            for b in 0..batch {
                let row = probs.row(b);
                for &p in row {
                    let guarded = p + ENTROPY_EPS;
                    entropy -= guarded * guarded.ln();
                }
                let choice = sample_categorical(row, rng);
                proposal[b * self.heads.len() + item] = choice as f32;
                indices.push(choice);
            }
            nodes.push(SampleNode::new(indices, probs)?);
        }
        let proposal = Tensor::from_vec(batch, self.heads.len(), proposal)?;
        Ok((nodes, proposal, entropy))
    }

    /// Accumulates per-item score-function gradients and returns the summed
    /// gradient with respect to the hidden state.
    pub fn backward(
        &mut self,
        hidden: &Tensor,
        nodes: &[SampleNode],
        weights: &[f32],
    ) -> PureResult<Tensor> {
        let (batch, width) = hidden.shape();
        if nodes.len() != self.heads.len() {
            return Err(TensorError::DataLength {
                expected: self.heads.len(),
                got: nodes.len(),
            });
        }
        if weights.len() != batch {
            return Err(TensorError::DataLength {
                expected: batch,
                got: weights.len(),
            });
        }
        let mut total = Tensor::zeros(batch, width)?;
        for (head, node) in self.heads.iter_mut().zip(nodes) {
            let mut grad_logits = Vec::with_capacity(batch * self.num_counts);
            for b in 0..batch {
                let row = node.dist().row(b);
                let chosen = node.indices()[b];
                for (k, &p) in row.iter().enumerate() {
                    let indicator = if k == chosen { 1.0 } else { 0.0 };
                    grad_logits.push((p - indicator) * weights[b]);
                }
            }
            let grad_logits = Tensor::from_vec(batch, self.num_counts, grad_logits)?;
            let grad_hidden = head.backward(hidden, &grad_logits)?;
            total.add_scaled(&grad_hidden, 1.0)?;
        }
        Ok(total)
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for head in &self.heads {
            head.visit_parameters(visitor)?;
        }
        Ok(())
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for head in &mut self.heads {
            head.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn samples_stay_inside_count_range() {
        let policy = ProposalPolicy::new(8, 6, 3).unwrap();
        let hidden = Tensor::from_vec(4, 8, vec![0.25; 32]).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let (nodes, proposal, entropy) = policy.forward(&hidden, &mut rng).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(proposal.shape(), (4, 3));
        assert!(proposal.data().iter().all(|&v| v >= 0.0 && v < 6.0));
        assert!(entropy >= 0.0);
    }

    #[test]
    fn heads_are_independent_parameter_sets() {
        let policy = ProposalPolicy::new(4, 6, 3).unwrap();
        let mut names = Vec::new();
        policy
            .visit_parameters(&mut |param| {
                names.push(param.name().to_string());
                Ok(())
            })
            .unwrap();
        // Weight and bias per item head.
        assert_eq!(names.len(), 6);
        assert!(names.iter().any(|n| n.contains("item0")));
        assert!(names.iter().any(|n| n.contains("item2")));
    }

    #[test]
    fn backward_touches_every_head() {
        let mut policy = ProposalPolicy::new(4, 5, 2).unwrap();
        let hidden = Tensor::from_vec(2, 4, vec![0.1; 8]).unwrap();
        let mut rng = StdRng::seed_from_u64(23);
        let (nodes, _, _) = policy.forward(&hidden, &mut rng).unwrap();
        let grad = policy.backward(&hidden, &nodes, &[1.0, 0.5]).unwrap();
        assert_eq!(grad.shape(), (2, 4));
        for head in &policy.heads {
            assert!(head.weight().gradient().is_some());
        }
    }
}
