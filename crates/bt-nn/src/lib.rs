// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

//! `nn.Module`-style layer kit for the BarterTorch negotiation model.
//!
//! The surface mirrors the familiar forward/backward module contract while
//! staying entirely in pure Rust: explicit gradient accumulators instead of a
//! tape, and interior-mutable recurrent state for stepwise cells.

pub mod init;
pub mod layers;
pub mod module;

pub use layers::{softmax_rows, Embedding, Linear, LstmCell, Relu};
pub use module::{Module, Parameter};

pub use bt_tensor::{PureResult, Tensor, TensorError};
