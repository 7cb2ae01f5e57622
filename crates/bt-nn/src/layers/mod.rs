// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

pub mod activation;
pub mod embedding;
pub mod linear;
pub mod lstm_cell;
pub mod softmax;

pub use activation::Relu;
pub use embedding::Embedding;
pub use linear::Linear;
pub use lstm_cell::LstmCell;
pub use softmax::softmax_rows;
