// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::policy::ENTROPY_EPS;
use crate::sample::{sample_categorical, SampleNode};
use crate::{PureResult, Tensor, TensorError};
use bt_nn::{softmax_rows, Linear, LstmCell, Module};
use rand::Rng;
use std::cell::RefCell;

/// Everything one utterance generation produced: the per-step sample nodes,
/// the assembled `(batch, max_len)` token tensor, and the summed entropy of
/// the per-step distributions. The entropy is reported but not folded into
/// the agent's regularisation loss; weighting it is a caller decision.
pub struct UtteranceOutput {
    pub nodes: Vec<SampleNode>,
    pub tokens: Tensor,
    pub entropy: f32,
}

/// Autoregressive fixed-length utterance generator.
///
/// The recurrent state is seeded with the shared hidden vector; each step
/// one-hot encodes the previous sample (token 0 as the sentinel start), runs
/// one LSTM-cell step, projects to vocabulary logits, and samples the next
/// token from the softmax.
pub struct UtterancePolicy {
    cell: LstmCell,
    h1: Linear,
    num_tokens: usize,
    max_len: usize,
    cache: RefCell<Option<StepCache>>,
}

struct StepCache {
    onehots: Vec<Tensor>,
    outputs: Vec<Tensor>,
}

impl UtterancePolicy {
    pub fn new(embedding_size: usize, num_tokens: usize, max_len: usize) -> PureResult<Self> {
        Ok(Self {
            cell: LstmCell::new("utterance_policy::lstm", num_tokens, embedding_size)?,
            h1: Linear::new("utterance_policy::h1", embedding_size, num_tokens)?,
            num_tokens,
            max_len,
            cache: RefCell::new(None),
        })
    }

    pub fn gaussian<R: Rng>(
        embedding_size: usize,
        num_tokens: usize,
        max_len: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        Ok(Self {
            cell: LstmCell::gaussian("utterance_policy::lstm", num_tokens, embedding_size, rng)?,
            h1: Linear::gaussian("utterance_policy::h1", embedding_size, num_tokens, rng)?,
            num_tokens,
            max_len,
            cache: RefCell::new(None),
        })
    }

    fn onehot(&self, tokens: &[usize]) -> PureResult<Tensor> {
        let batch = tokens.len();
        let mut data = vec![0.0f32; batch * self.num_tokens];
        for (b, &token) in tokens.iter().enumerate() {
            if token >= self.num_tokens {
                return Err(TensorError::TokenOutOfRange {
                    token: token as f32,
                    vocab: self.num_tokens,
                });
            }
            data[b * self.num_tokens + token] = 1.0;
        }
        Tensor::from_vec(batch, self.num_tokens, data)
    }

    /// Generates exactly `max_len` tokens per batch row.
    pub fn forward<R: Rng>(&self, hidden: &Tensor, rng: &mut R) -> PureResult<UtteranceOutput> {
        let batch = hidden.shape().0;
        let zero_cell = Tensor::zeros(batch, self.cell.hidden_dim())?;
        self.cell.set_state(hidden, &zero_cell)?;

        let mut last = vec![0usize; batch];
        let mut nodes = Vec::with_capacity(self.max_len);
        let mut onehots = Vec::with_capacity(self.max_len);
        let mut outputs = Vec::with_capacity(self.max_len);
        let mut entropy = 0.0f32;
        for _step in 0..self.max_len {
            let input = self.onehot(&last)?;
            let out = self.cell.forward(&input)?;
            let probs = softmax_rows(&self.h1.forward(&out)?)?;
            let mut indices = Vec::with_capacity(batch);
            for b in 0..batch {
                let row = probs.row(b);
                for &p in row {
                    let guarded = p + ENTROPY_EPS;
                    entropy -= guarded * guarded.ln();
                }
                indices.push(sample_categorical(row, rng));
            }
            last.copy_from_slice(&indices);
            nodes.push(SampleNode::new(indices, probs)?);
            onehots.push(input);
            outputs.push(out);
        }

        let mut tokens = vec![0.0f32; batch * self.max_len];
        for (step, node) in nodes.iter().enumerate() {
            for b in 0..batch {
                tokens[b * self.max_len + step] = node.indices()[b] as f32;
            }
        }
        let tokens = Tensor::from_vec(batch, self.max_len, tokens)?;
        *self.cache.borrow_mut() = Some(StepCache { onehots, outputs });
        Ok(UtteranceOutput {
            nodes,
            tokens,
            entropy,
        })
    }

    /// Walks the generation backwards under score-function weights and
    /// returns the gradient with respect to the seeding hidden state.
    pub fn backward(&mut self, nodes: &[SampleNode], weights: &[f32]) -> PureResult<Tensor> {
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "utterance_policy backward without a cached forward",
            })?;
        if nodes.len() != cache.outputs.len() {
            return Err(TensorError::DataLength {
                expected: cache.outputs.len(),
                got: nodes.len(),
            });
        }
        for step in (0..nodes.len()).rev() {
            let node = &nodes[step];
            let (batch, width) = node.dist().shape();
            if weights.len() != batch {
                return Err(TensorError::DataLength {
                    expected: batch,
                    got: weights.len(),
                });
            }
            let mut grad_logits = Vec::with_capacity(batch * width);
            for b in 0..batch {
                let row = node.dist().row(b);
                let chosen = node.indices()[b];
                for (k, &p) in row.iter().enumerate() {
                    let indicator = if k == chosen { 1.0 } else { 0.0 };
                    grad_logits.push((p - indicator) * weights[b]);
                }
            }
            let grad_logits = Tensor::from_vec(batch, width, grad_logits)?;
            let grad_hidden = self.h1.backward(&cache.outputs[step], &grad_logits)?;
            // Sampled-token inputs are detached; their gradient is dropped.
            let _ = self.cell.backward(&cache.onehots[step], &grad_hidden)?;
        }
        let (grad_initial_hidden, _grad_initial_cell) =
            self.cell.take_carry().ok_or(TensorError::InvalidValue {
                label: "utterance_policy backward produced no recurrent carry",
            })?;
        Ok(grad_initial_hidden)
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.cell.visit_parameters(visitor)?;
        self.h1.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.cell.visit_parameters_mut(visitor)?;
        self.h1.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generates_fixed_length_in_vocab_tokens() {
        let policy = UtterancePolicy::new(8, 10, 6).unwrap();
        let hidden = Tensor::from_vec(2, 8, vec![0.2; 16]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let out = policy.forward(&hidden, &mut rng).unwrap();
        assert_eq!(out.nodes.len(), 6);
        assert_eq!(out.tokens.shape(), (2, 6));
        assert!(out.tokens.data().iter().all(|&t| t >= 0.0 && t < 10.0));
        assert!(out.entropy >= 0.0);
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let policy = UtterancePolicy::new(4, 10, 6).unwrap();
        let hidden = Tensor::from_vec(1, 4, vec![0.5, -0.5, 0.25, 0.0]).unwrap();
        let a = policy
            .forward(&hidden, &mut StdRng::seed_from_u64(77))
            .unwrap();
        let b = policy
            .forward(&hidden, &mut StdRng::seed_from_u64(77))
            .unwrap();
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn conditioning_changes_the_distribution_path() {
        let mut rng_init = StdRng::seed_from_u64(2);
        let policy = UtterancePolicy::gaussian(6, 10, 6, &mut rng_init).unwrap();
        let warm = Tensor::from_vec(1, 6, vec![2.0, -2.0, 1.5, -1.5, 1.0, -1.0]).unwrap();
        let cold = Tensor::zeros(1, 6).unwrap();
        let out_warm = policy.forward(&warm, &mut StdRng::seed_from_u64(1)).unwrap();
        let out_cold = policy.forward(&cold, &mut StdRng::seed_from_u64(1)).unwrap();
        // Same RNG stream, different conditioning: the step distributions differ.
        assert_ne!(out_warm.nodes[0].dist(), out_cold.nodes[0].dist());
    }

    #[test]
    fn backward_returns_gradient_for_the_seed_state() {
        let mut policy = UtterancePolicy::new(4, 5, 3).unwrap();
        let hidden = Tensor::from_vec(2, 4, vec![0.1; 8]).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let out = policy.forward(&hidden, &mut rng).unwrap();
        let grad = policy.backward(&out.nodes, &[1.0, -1.0]).unwrap();
        assert_eq!(grad.shape(), (2, 4));
        assert!(policy.h1.weight().gradient().is_some());
        // Backward consumed the cache; a second call must fail.
        assert!(policy.backward(&out.nodes, &[1.0, -1.0]).is_err());
    }
}
