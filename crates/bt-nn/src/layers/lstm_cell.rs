// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::init::gaussian_tensor;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::Rng;
use std::cell::RefCell;

fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Batched LSTM cell.
///
/// One `forward` call advances the whole batch by a single timestep; the
/// `(hidden, cell)` state is threaded across calls through interior
/// mutability and can be seeded explicitly with [`LstmCell::set_state`].
/// Each step caches its activations so `backward` can be called once per
/// step in reverse order, carrying the recurrent gradient between pops.
#[derive(Debug)]
pub struct LstmCell {
    input_dim: usize,
    hidden_dim: usize,
    weight_ih: Parameter,
    weight_hh: Parameter,
    bias_ih: Parameter,
    bias_hh: Parameter,
    state: RefCell<Option<(Tensor, Tensor)>>,
    caches: RefCell<Vec<StepCache>>,
    carry: RefCell<Option<(Tensor, Tensor)>>,
}

#[derive(Debug, Clone)]
struct StepCache {
    input: Tensor,
    prev_hidden: Tensor,
    prev_cell: Tensor,
    gate_i: Vec<f32>,
    gate_f: Vec<f32>,
    gate_g: Vec<f32>,
    gate_o: Vec<f32>,
    cell: Vec<f32>,
}

impl LstmCell {
    /// Creates a new cell with small deterministic parameters.
    pub fn new(name: impl Into<String>, input_dim: usize, hidden_dim: usize) -> PureResult<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: hidden_dim,
            });
        }
        let name = name.into();
        let weight_ih = Tensor::from_fn(input_dim, 4 * hidden_dim, |row, col| {
            (((row * 13 + col * 7) % 17) as f32 + 1.0) * 0.01
        })?;
        let weight_hh = Tensor::from_fn(hidden_dim, 4 * hidden_dim, |row, col| {
            (((row * 11 + col * 5) % 23) as f32 + 1.0) * 0.01
        })?;
        Self::assemble(name, input_dim, hidden_dim, weight_ih, weight_hh)
    }

    /// Creates a cell with Gaussian weights drawn from the caller's RNG.
    pub fn gaussian<R: Rng>(
        name: impl Into<String>,
        input_dim: usize,
        hidden_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: hidden_dim,
            });
        }
        let name = name.into();
        let weight_ih = gaussian_tensor(input_dim, 4 * hidden_dim, rng)?;
        let weight_hh = gaussian_tensor(hidden_dim, 4 * hidden_dim, rng)?;
        Self::assemble(name, input_dim, hidden_dim, weight_ih, weight_hh)
    }

    fn assemble(
        name: String,
        input_dim: usize,
        hidden_dim: usize,
        weight_ih: Tensor,
        weight_hh: Tensor,
    ) -> PureResult<Self> {
        let bias_ih = Tensor::zeros(1, 4 * hidden_dim)?;
        let bias_hh = Tensor::zeros(1, 4 * hidden_dim)?;
        Ok(Self {
            input_dim,
            hidden_dim,
            weight_ih: Parameter::new(format!("{name}::weight_ih"), weight_ih),
            weight_hh: Parameter::new(format!("{name}::weight_hh"), weight_hh),
            bias_ih: Parameter::new(format!("{name}::bias_ih"), bias_ih),
            bias_hh: Parameter::new(format!("{name}::bias_hh"), bias_hh),
            state: RefCell::new(None),
            caches: RefCell::new(Vec::new()),
            carry: RefCell::new(None),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Drops the threaded state, step caches, and recurrent gradient carry.
    pub fn reset_state(&self) {
        self.state.borrow_mut().take();
        self.caches.borrow_mut().clear();
        self.carry.borrow_mut().take();
    }

    /// Seeds the threaded `(hidden, cell)` state explicitly.
    pub fn set_state(&self, hidden: &Tensor, cell: &Tensor) -> PureResult<()> {
        if hidden.shape() != cell.shape() || hidden.shape().1 != self.hidden_dim {
            return Err(TensorError::ShapeMismatch {
                left: hidden.shape(),
                right: cell.shape(),
            });
        }
        self.caches.borrow_mut().clear();
        self.carry.borrow_mut().take();
        *self.state.borrow_mut() = Some((hidden.clone(), cell.clone()));
        Ok(())
    }

    /// Returns a copy of the threaded state, if a step has run.
    pub fn state(&self) -> Option<(Tensor, Tensor)> {
        self.state.borrow().clone()
    }

    /// Number of cached steps awaiting a backward pass.
    pub fn pending_steps(&self) -> usize {
        self.caches.borrow().len()
    }

    /// Takes the recurrent gradient carry left after walking every cached
    /// step: the gradient with respect to the state the sequence started
    /// from. Returns `None` if no backward step has run.
    pub fn take_carry(&self) -> Option<(Tensor, Tensor)> {
        self.carry.borrow_mut().take()
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        if cols != self.input_dim {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.input_dim),
            });
        }
        Ok(())
    }
}

impl Module for LstmCell {
    /// Advances the batch by one timestep and returns the hidden output.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let batch = input.shape().0;
        let hidden_dim = self.hidden_dim;
        let (prev_hidden, prev_cell) = match self.state.borrow().clone() {
            Some((h, c)) => {
                if h.shape().0 != batch {
                    return Err(TensorError::ShapeMismatch {
                        left: h.shape(),
                        right: (batch, hidden_dim),
                    });
                }
                (h, c)
            }
            None => (
                Tensor::zeros(batch, hidden_dim)?,
                Tensor::zeros(batch, hidden_dim)?,
            ),
        };

        let mut gates = input.matmul(self.weight_ih.value())?;
        let recurrent = prev_hidden.matmul(self.weight_hh.value())?;
        gates.add_scaled(&recurrent, 1.0)?;
        gates.add_row_inplace(self.bias_ih.value().data())?;
        gates.add_row_inplace(self.bias_hh.value().data())?;

        let mut gate_i = vec![0.0f32; batch * hidden_dim];
        let mut gate_f = vec![0.0f32; batch * hidden_dim];
        let mut gate_g = vec![0.0f32; batch * hidden_dim];
        let mut gate_o = vec![0.0f32; batch * hidden_dim];
        let mut cell = vec![0.0f32; batch * hidden_dim];
        let mut hidden = vec![0.0f32; batch * hidden_dim];
        let gate_data = gates.data();
        let prev_cell_data = prev_cell.data();
        for b in 0..batch {
            let gate_row = b * 4 * hidden_dim;
            let row = b * hidden_dim;
            for unit in 0..hidden_dim {
                let gi = sigmoid(gate_data[gate_row + unit]);
                let gf = sigmoid(gate_data[gate_row + hidden_dim + unit]);
                let gg = gate_data[gate_row + 2 * hidden_dim + unit].tanh();
                let go = sigmoid(gate_data[gate_row + 3 * hidden_dim + unit]);
                let c = gf * prev_cell_data[row + unit] + gi * gg;
                gate_i[row + unit] = gi;
                gate_f[row + unit] = gf;
                gate_g[row + unit] = gg;
                gate_o[row + unit] = go;
                cell[row + unit] = c;
                hidden[row + unit] = go * c.tanh();
            }
        }

        let hidden = Tensor::from_vec(batch, hidden_dim, hidden)?;
        let cell_tensor = Tensor::from_vec(batch, hidden_dim, cell.clone())?;
        self.caches.borrow_mut().push(StepCache {
            input: input.clone(),
            prev_hidden,
            prev_cell,
            gate_i,
            gate_f,
            gate_g,
            gate_o,
            cell,
        });
        *self.state.borrow_mut() = Some((hidden.clone(), cell_tensor));
        Ok(hidden)
    }

    /// Pops the most recent step cache and propagates its gradient, adding
    /// the recurrent carry from any step already walked.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let cache = self
            .caches
            .borrow_mut()
            .pop()
            .ok_or(TensorError::InvalidValue {
                label: "lstm_cell cache empty; forward each step before backward",
            })?;
        if input.shape() != cache.input.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: cache.input.shape(),
            });
        }
        let (batch, hidden_dim) = (cache.prev_hidden.shape().0, self.hidden_dim);
        if grad_output.shape() != (batch, hidden_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, hidden_dim),
            });
        }

        let (carry_h, carry_c) = match self.carry.borrow_mut().take() {
            Some((h, c)) => (h, c),
            None => (
                Tensor::zeros(batch, hidden_dim)?,
                Tensor::zeros(batch, hidden_dim)?,
            ),
        };

        let mut gate_grad = vec![0.0f32; batch * 4 * hidden_dim];
        let mut grad_c_prev = vec![0.0f32; batch * hidden_dim];
        let grad_h = grad_output.data();
        let carry_h_data = carry_h.data();
        let carry_c_data = carry_c.data();
        let prev_cell = cache.prev_cell.data();
        for b in 0..batch {
            let row = b * hidden_dim;
            let gate_row = b * 4 * hidden_dim;
            for unit in 0..hidden_dim {
                let dh = grad_h[row + unit] + carry_h_data[row + unit];
                let i = cache.gate_i[row + unit];
                let f = cache.gate_f[row + unit];
                let g = cache.gate_g[row + unit];
                let o = cache.gate_o[row + unit];
                let tanh_c = cache.cell[row + unit].tanh();
                let do_gate = dh * tanh_c * o * (1.0 - o);
                let dc = dh * o * (1.0 - tanh_c * tanh_c) + carry_c_data[row + unit];
                let di = dc * g * i * (1.0 - i);
                let dg = dc * i * (1.0 - g * g);
                let df = dc * prev_cell[row + unit] * f * (1.0 - f);
                grad_c_prev[row + unit] = dc * f;
                gate_grad[gate_row + unit] = di;
                gate_grad[gate_row + hidden_dim + unit] = df;
                gate_grad[gate_row + 2 * hidden_dim + unit] = dg;
                gate_grad[gate_row + 3 * hidden_dim + unit] = do_gate;
            }
        }
        let gate_grad = Tensor::from_vec(batch, 4 * hidden_dim, gate_grad)?;

        let inv_batch = 1.0 / batch as f32;
        let grad_w_ih = cache.input.transpose().matmul(&gate_grad)?.scale(inv_batch)?;
        let grad_w_hh = cache
            .prev_hidden
            .transpose()
            .matmul(&gate_grad)?
            .scale(inv_batch)?;
        self.weight_ih.accumulate_euclidean(&grad_w_ih)?;
        self.weight_hh.accumulate_euclidean(&grad_w_hh)?;
        let summed = gate_grad.sum_axis0();
        let grad_bias = Tensor::from_vec(1, summed.len(), summed)?.scale(inv_batch)?;
        self.bias_ih.accumulate_euclidean(&grad_bias)?;
        self.bias_hh.accumulate_euclidean(&grad_bias)?;

        let grad_input = gate_grad.matmul(&self.weight_ih.value().transpose())?;
        let grad_h_prev = gate_grad.matmul(&self.weight_hh.value().transpose())?;
        *self.carry.borrow_mut() = Some((
            grad_h_prev,
            Tensor::from_vec(batch, hidden_dim, grad_c_prev)?,
        ));
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight_ih)?;
        visitor(&self.weight_hh)?;
        visitor(&self.bias_ih)?;
        visitor(&self.bias_hh)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight_ih)?;
        visitor(&mut self.weight_hh)?;
        visitor(&mut self.bias_ih)?;
        visitor(&mut self.bias_hh)
    }
}
