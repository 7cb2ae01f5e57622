// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

//! Dense row-major tensor core for the BarterTorch negotiation model.
//!
//! Everything stays in pure Rust: a `(rows, cols)` matrix of `f32` values plus
//! the handful of operations the encoders and policies need. Constructors
//! validate shapes up front so later math can assume consistency.

use core::fmt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Result alias used throughout the workspace for tensor-level failures.
pub type PureResult<T> = Result<T, TensorError>;

/// Number of matrix rows above which matmul fans out across the rayon pool.
const PAR_ROW_THRESHOLD: usize = 32;

/// Errors emitted by tensor utilities and the layers built on top of them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise panic.
    EmptyInput(&'static str),
    /// A token id fell outside the embedding vocabulary.
    TokenOutOfRange { token: f32, vocab: usize },
    /// Attempted to restore a parameter missing from the state dict.
    MissingParameter { name: String },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::TokenOutOfRange { token, vocab } => {
                write!(
                    f,
                    "token id {token} lies outside the embedding vocabulary [0, {vocab})"
                )
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// Dense row-major matrix of `f32` values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::guard_shape(rows, cols)?;
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Builds a tensor from an existing row-major buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::guard_shape(rows, cols)?;
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a tensor by evaluating `f(row, col)` for every element.
    pub fn from_fn(
        rows: usize,
        cols: usize,
        mut f: impl FnMut(usize, usize) -> f32,
    ) -> PureResult<Self> {
        Self::guard_shape(rows, cols)?;
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    fn guard_shape(rows: usize, cols: usize) -> PureResult<()> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(())
    }

    /// Returns the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Immutable view of the row-major backing buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the row-major backing buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrows a single row.
    ///
    /// # Panics
    ///
    /// Panics if `r` is not below [`Tensor::rows`]. Hot inner loops index
    /// rows they just measured; callers holding an untrusted index must
    /// bounds-check first.
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Matrix product `self @ rhs`. Rows fan out over rayon once the batch is
    /// large enough to amortise the scheduling cost.
    pub fn matmul(&self, rhs: &Tensor) -> PureResult<Tensor> {
        if self.cols != rhs.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: rhs.shape(),
            });
        }
        let (m, k, n) = (self.rows, self.cols, rhs.cols);
        let mut out = vec![0.0f32; m * n];
        let kernel = |(r, out_row): (usize, &mut [f32])| {
            let lhs_row = &self.data[r * k..(r + 1) * k];
            for (idx, &lhs) in lhs_row.iter().enumerate() {
                if lhs == 0.0 {
                    continue;
                }
                let rhs_row = &rhs.data[idx * n..(idx + 1) * n];
                for (acc, &value) in out_row.iter_mut().zip(rhs_row) {
                    *acc += lhs * value;
                }
            }
        };
        if m >= PAR_ROW_THRESHOLD {
            out.par_chunks_mut(n).enumerate().for_each(kernel);
        } else {
            out.chunks_mut(n).enumerate().for_each(kernel);
        }
        Tensor::from_vec(m, n, out)
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.rows * self.cols];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Returns `self * factor` as a fresh tensor.
    pub fn scale(&self, factor: f32) -> PureResult<Tensor> {
        Tensor::from_vec(
            self.rows,
            self.cols,
            self.data.iter().map(|v| v * factor).collect(),
        )
    }

    /// Accumulates `other * factor` into `self` in place.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += src * factor;
        }
        Ok(())
    }

    /// Adds a `(cols,)` bias row to every row of the tensor.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (dst, src) in row.iter_mut().zip(bias) {
                *dst += src;
            }
        }
        Ok(())
    }

    /// Sums the tensor down axis 0, returning one value per column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.cols];
        for row in self.data.chunks(self.cols) {
            for (acc, &value) in out.iter_mut().zip(row) {
                *acc += value;
            }
        }
        out
    }

    /// Copies the column range `[start, end)` into a fresh tensor.
    pub fn col_slice(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.cols {
            return Err(TensorError::InvalidValue {
                label: "col_slice range",
            });
        }
        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for row in self.data.chunks(self.cols) {
            data.extend_from_slice(&row[start..end]);
        }
        Tensor::from_vec(self.rows, width, data)
    }

    /// Concatenates tensors with equal row counts along the feature axis.
    pub fn concat_cols(parts: &[&Tensor]) -> PureResult<Tensor> {
        let first = parts.first().ok_or(TensorError::EmptyInput("concat_cols"))?;
        let rows = first.rows;
        let mut total_cols = 0;
        for part in parts {
            if part.rows != rows {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: part.shape(),
                });
            }
            total_cols += part.cols;
        }
        let mut data = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for part in parts {
                data.extend_from_slice(part.row(r));
            }
        }
        Tensor::from_vec(rows, total_cols, data)
    }

    /// Squared L2 norm of the whole tensor.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_reject_degenerate_shapes() {
        assert!(matches!(
            Tensor::zeros(0, 4),
            Err(TensorError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Tensor::from_vec(2, 2, vec![1.0; 3]),
            Err(TensorError::DataLength {
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    #[should_panic]
    fn row_rejects_out_of_range_index() {
        let t = Tensor::zeros(2, 3).unwrap();
        let _ = t.row(2);
    }

    #[test]
    fn matmul_matches_manual_product() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dims() {
        let a = Tensor::zeros(2, 3).unwrap();
        let b = Tensor::zeros(2, 2).unwrap();
        assert!(matches!(
            a.matmul(&b),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn transpose_round_trips() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.transpose(), a);
    }

    #[test]
    fn concat_cols_stitches_features() {
        let a = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_vec(2, 1, vec![5.0, 6.0]).unwrap();
        let cat = Tensor::concat_cols(&[&a, &b]).unwrap();
        assert_eq!(cat.shape(), (2, 3));
        assert_eq!(cat.data(), &[1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }

    #[test]
    fn col_slice_extracts_step_windows() {
        let a = Tensor::from_vec(2, 4, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).unwrap();
        let mid = a.col_slice(1, 3).unwrap();
        assert_eq!(mid.shape(), (2, 2));
        assert_eq!(mid.data(), &[1.0, 2.0, 5.0, 6.0]);
        assert!(a.col_slice(3, 3).is_err());
        assert!(a.col_slice(2, 5).is_err());
    }

    #[test]
    fn add_row_inplace_applies_bias_per_row() {
        let mut a = Tensor::zeros(2, 2).unwrap();
        a.add_row_inplace(&[1.0, -1.0]).unwrap();
        assert_eq!(a.data(), &[1.0, -1.0, 1.0, -1.0]);
        assert_eq!(a.sum_axis0(), vec![2.0, -2.0]);
    }
}
