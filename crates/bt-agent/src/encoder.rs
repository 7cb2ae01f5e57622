// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::{PureResult, Tensor, TensorError};
use bt_nn::{Embedding, LstmCell, Module};
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Recurrent encoder over integer-token sequences.
///
/// Embeds a `(batch, seq_len)` tensor of token ids, steps an LSTM cell across
/// the sequence with zero-initialised state, and returns the final hidden
/// output `(batch, embedding_size)`. The embedding table can be shared with
/// another encoder through the `Rc<RefCell<_>>` handle so both read the same
/// co-trained parameters; only the owning encoder visits those parameters.
pub struct SequenceEncoder {
    embedding: Rc<RefCell<Embedding>>,
    owns_embedding: bool,
    cell: LstmCell,
    embedding_size: usize,
    cache: RefCell<Option<(Tensor, Tensor)>>,
}

impl SequenceEncoder {
    /// Creates an encoder with its own embedding table.
    pub fn new<R: Rng>(
        name: &str,
        vocab_size: usize,
        embedding_size: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        let embedding = Embedding::gaussian(format!("{name}::embedding"), vocab_size, embedding_size, rng)?;
        let cell = LstmCell::gaussian(format!("{name}::lstm"), embedding_size, embedding_size, rng)?;
        Ok(Self {
            embedding: Rc::new(RefCell::new(embedding)),
            owns_embedding: true,
            cell,
            embedding_size,
            cache: RefCell::new(None),
        })
    }

    /// Creates an encoder that reads an embedding table owned elsewhere.
    pub fn with_shared_embedding<R: Rng>(
        name: &str,
        embedding: Rc<RefCell<Embedding>>,
        rng: &mut R,
    ) -> PureResult<Self> {
        let embedding_size = embedding.borrow().embed_dim();
        let cell = LstmCell::gaussian(format!("{name}::lstm"), embedding_size, embedding_size, rng)?;
        Ok(Self {
            embedding,
            owns_embedding: false,
            cell,
            embedding_size,
            cache: RefCell::new(None),
        })
    }

    /// Handle to the embedding table, for sharing with another encoder.
    pub fn embedding_handle(&self) -> Rc<RefCell<Embedding>> {
        Rc::clone(&self.embedding)
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// Encodes the batch to its final hidden vector `(batch, embedding_size)`.
    pub fn forward(&self, tokens: &Tensor) -> PureResult<Tensor> {
        let (_batch, steps) = tokens.shape();
        let embedded = self.embedding.borrow().forward(tokens)?;
        self.cell.reset_state();
        let mut hidden = None;
        for t in 0..steps {
            let step = embedded.col_slice(t * self.embedding_size, (t + 1) * self.embedding_size)?;
            hidden = Some(self.cell.forward(&step)?);
        }
        let hidden = hidden.ok_or(TensorError::EmptyInput("sequence_encoder tokens"))?;
        *self.cache.borrow_mut() = Some((tokens.clone(), embedded));
        Ok(hidden)
    }

    /// Backpropagates a gradient on the final hidden vector through every
    /// timestep and into the cell and embedding parameters.
    pub fn backward(&mut self, grad_hidden: &Tensor) -> PureResult<()> {
        let (tokens, embedded) = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "sequence_encoder backward without a cached forward",
            })?;
        let (batch, steps) = tokens.shape();
        if grad_hidden.shape() != (batch, self.embedding_size) {
            return Err(TensorError::ShapeMismatch {
                left: grad_hidden.shape(),
                right: (batch, self.embedding_size),
            });
        }

        let zero_grad = Tensor::zeros(batch, self.embedding_size)?;
        let mut step_grads = vec![None; steps];
        for t in (0..steps).rev() {
            let step = embedded.col_slice(t * self.embedding_size, (t + 1) * self.embedding_size)?;
            let grad = if t + 1 == steps { grad_hidden } else { &zero_grad };
            step_grads[t] = Some(self.cell.backward(&step, grad)?);
        }
        self.cell.take_carry();

        let mut grad_embedded = Vec::with_capacity(batch * steps * self.embedding_size);
        for b in 0..batch {
            for grad in step_grads.iter().flatten() {
                grad_embedded.extend_from_slice(grad.row(b));
            }
        }
        let grad_embedded =
            Tensor::from_vec(batch, steps * self.embedding_size, grad_embedded)?;
        self.embedding.borrow_mut().backward(&tokens, &grad_embedded)?;
        Ok(())
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if self.owns_embedding {
            self.embedding.borrow().visit_parameters(visitor)?;
        }
        self.cell.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut bt_nn::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if self.owns_embedding {
            self.embedding.borrow_mut().visit_parameters_mut(visitor)?;
        }
        self.cell.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn encoder_summarises_batches_of_sequences() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = SequenceEncoder::new("ctx", 11, 8, &mut rng).unwrap();
        let tokens = Tensor::from_vec(2, 3, vec![0.0, 5.0, 10.0, 3.0, 3.0, 3.0]).unwrap();
        let hidden = encoder.forward(&tokens).unwrap();
        assert_eq!(hidden.shape(), (2, 8));
        assert!(hidden.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn encoder_state_resets_between_calls() {
        let mut rng = StdRng::seed_from_u64(2);
        let encoder = SequenceEncoder::new("ctx", 11, 4, &mut rng).unwrap();
        let tokens = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let first = encoder.forward(&tokens).unwrap();
        let second = encoder.forward(&tokens).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn encoder_rejects_out_of_vocab_tokens() {
        let mut rng = StdRng::seed_from_u64(3);
        let encoder = SequenceEncoder::new("ctx", 11, 4, &mut rng).unwrap();
        let tokens = Tensor::from_vec(1, 2, vec![1.0, 11.0]).unwrap();
        assert!(matches!(
            encoder.forward(&tokens),
            Err(TensorError::TokenOutOfRange { vocab: 11, .. })
        ));
    }

    #[test]
    fn shared_embedding_is_observable_through_both_encoders() {
        let mut rng = StdRng::seed_from_u64(4);
        let context = SequenceEncoder::new("ctx", 11, 4, &mut rng).unwrap();
        let proposal =
            SequenceEncoder::with_shared_embedding("prop", context.embedding_handle(), &mut rng)
                .unwrap();

        let tokens = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let before = proposal.forward(&tokens).unwrap();

        // Nudge the shared table through the context encoder's handle.
        {
            let handle = context.embedding_handle();
            let mut table = handle.borrow_mut();
            let weight = table.weight_mut().value_mut();
            for value in weight.data_mut() {
                *value += 0.5;
            }
        }
        let after = proposal.forward(&tokens).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn encoder_backward_reaches_cell_and_embedding() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut encoder = SequenceEncoder::new("ctx", 11, 4, &mut rng).unwrap();
        let tokens = Tensor::from_vec(2, 3, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let _ = encoder.forward(&tokens).unwrap();
        let grad = Tensor::from_vec(2, 4, vec![0.1; 8]).unwrap();
        encoder.backward(&grad).unwrap();

        let mut grads = 0usize;
        encoder
            .visit_parameters(&mut |param| {
                if param.gradient().is_some() {
                    grads += 1;
                }
                Ok(())
            })
            .unwrap();
        // Embedding weight plus the four cell parameters.
        assert_eq!(grads, 5);

        // A second backward without a fresh forward must fail.
        assert!(encoder.backward(&grad).is_err());
    }
}
