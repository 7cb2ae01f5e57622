// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};

/// Stateless ReLU activation; does not participate in parameter visits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relu;

impl Relu {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = input.shape();
        let data = input.data().iter().map(|v| v.max(0.0)).collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(value, grad)| if *value > 0.0 { *grad } else { 0.0 })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&crate::module::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut crate::module::Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_clamps_and_gates_gradients() {
        let mut layer = Relu::new();
        let input = Tensor::from_vec(1, 4, vec![-1.0, 0.0, 0.5, 2.0]).unwrap();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.data(), &[0.0, 0.0, 0.5, 2.0]);

        let grad = Tensor::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let grad_in = layer.backward(&input, &grad).unwrap();
        assert_eq!(grad_in.data(), &[0.0, 0.0, 1.0, 1.0]);
    }
}
