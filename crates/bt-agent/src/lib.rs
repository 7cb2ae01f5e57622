// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

//! Multi-agent negotiation model.
//!
//! An [`AgentModel`] encodes a numeric context, the opponent's previous
//! utterance, and the previous proposal, combines them into a shared hidden
//! state, and samples three kinds of discrete action from learned
//! distributions: a termination bit, a fixed-length utterance, and a per-item
//! proposal. Every stochastic decision is returned as a [`SampleNode`] so a
//! policy-gradient trainer can drive the score-function update, and each
//! forward pass reports the entropy-regularisation loss term.

use thiserror::Error;

pub mod agent;
pub mod config;
pub mod encoder;
pub mod policy;
pub mod sample;

pub use agent::{AgentForward, AgentModel, ReinforceWeights};
pub use config::AgentConfig;
pub use encoder::SequenceEncoder;
pub use policy::{ProposalPolicy, TermPolicy, UtteranceOutput, UtterancePolicy};
pub use sample::SampleNode;

pub use bt_tensor::{PureResult, Tensor, TensorError};

/// Agent-level error wrapper so callers get negotiation-domain diagnostics
/// instead of raw tensor faults.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Wrapped tensor failure bubbling up from the math routines.
    #[error(transparent)]
    Tensor(#[from] TensorError),
    /// Constructor configuration failed validation.
    #[error("configuration rejected: {reason}")]
    InvalidConfig { reason: &'static str },
    /// Forward inputs disagree on the leading batch dimension.
    #[error(
        "input batch sizes disagree: context={context}, message={message}, proposal={proposal}"
    )]
    BatchMismatch {
        context: usize,
        message: usize,
        proposal: usize,
    },
    /// A forward input has the wrong number of columns.
    #[error("input '{name}' must have {expected} columns, received {got}")]
    InputWidth {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    /// REINFORCE weights do not cover the batch.
    #[error("reinforce weights for '{name}' must cover the batch of {expected}, received {got}")]
    WeightLength {
        name: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Convenient result alias for the agent surface.
pub type AgentResult<T> = Result<T, AgentError>;
