// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::init::gaussian_tensor;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::Rng;

fn token_to_index(value: f32, vocab_size: usize) -> PureResult<usize> {
    if !value.is_finite() {
        return Err(TensorError::TokenOutOfRange {
            token: value,
            vocab: vocab_size,
        });
    }
    let rounded = value.round();
    if rounded < 0.0 || rounded as usize >= vocab_size {
        return Err(TensorError::TokenOutOfRange {
            token: value,
            vocab: vocab_size,
        });
    }
    Ok(rounded as usize)
}

/// Token-embedding lookup table.
///
/// Inputs are integer token IDs stored as floats in a tensor shaped
/// `(batch, steps)`. Outputs are flattened embeddings shaped
/// `(batch, steps * embed_dim)` so sequence modules can slice out one step at
/// a time. IDs outside `[0, vocab_size)` are rejected rather than clamped.
#[derive(Debug)]
pub struct Embedding {
    weight: Parameter,
    vocab_size: usize,
    embed_dim: usize,
}

impl Embedding {
    pub fn new(name: impl Into<String>, vocab_size: usize, embed_dim: usize) -> PureResult<Self> {
        if vocab_size == 0 || embed_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: vocab_size.max(1),
                cols: embed_dim.max(1),
            });
        }
        let name = name.into();
        let mut scale = 0.01f32;
        let weight = Tensor::from_fn(vocab_size, embed_dim, |_r, _c| {
            let value = scale;
            scale = (scale + 0.013).rem_euclid(0.05).max(1e-4);
            value
        })?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            vocab_size,
            embed_dim,
        })
    }

    /// Creates an embedding table with Gaussian rows drawn from the caller's RNG.
    pub fn gaussian<R: Rng>(
        name: impl Into<String>,
        vocab_size: usize,
        embed_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if vocab_size == 0 || embed_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: vocab_size.max(1),
                cols: embed_dim.max(1),
            });
        }
        let name = name.into();
        let weight = gaussian_tensor(vocab_size, embed_dim, rng)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            vocab_size,
            embed_dim,
        })
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Mutable access for co-training through a shared handle.
    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }
}

impl Module for Embedding {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, steps) = input.shape();
        let output_cols = steps * self.embed_dim;
        let weights = self.weight.value().data();
        let input_data = input.data();
        let mut out = Vec::with_capacity(batch * output_cols);
        for b in 0..batch {
            let row_offset = b * steps;
            for t in 0..steps {
                let idx = token_to_index(input_data[row_offset + t], self.vocab_size)?;
                let start = idx * self.embed_dim;
                out.extend_from_slice(&weights[start..start + self.embed_dim]);
            }
        }
        Tensor::from_vec(batch, output_cols, out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, steps) = input.shape();
        let output_cols = steps * self.embed_dim;
        if grad_output.shape() != (batch, output_cols) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, output_cols),
            });
        }

        let input_data = input.data();
        let grad_data = grad_output.data();
        let mut grad_weight = vec![0.0f32; self.vocab_size * self.embed_dim];
        for b in 0..batch {
            let in_row = b * steps;
            let grad_row = b * output_cols;
            for t in 0..steps {
                let idx = token_to_index(input_data[in_row + t], self.vocab_size)?;
                let gw_base = idx * self.embed_dim;
                let go_base = grad_row + t * self.embed_dim;
                for c in 0..self.embed_dim {
                    grad_weight[gw_base + c] += grad_data[go_base + c];
                }
            }
        }
        let grad_w = Tensor::from_vec(self.vocab_size, self.embed_dim, grad_weight)?
            .scale(1.0 / batch as f32)?;
        self.weight.accumulate_euclidean(&grad_w)?;

        // Token ids carry no gradient of their own.
        Tensor::zeros(batch, steps)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)
    }
}
