// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};

/// Vocabulary shared by every sequence encoder: the digits 0..=10.
pub const ENCODER_VOCAB: usize = 11;

/// Constructor configuration for [`crate::AgentModel`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Gates the utterance branch. When disabled the message encoder is
    /// bypassed and the emitted utterance is all-zero.
    pub enable_comms: bool,
    /// Reserved: the reference behaviour never dispatches on this flag, so
    /// proposal generation is always active.
    pub enable_proposal: bool,
    /// Weight of the termination entropy in the regularisation loss.
    pub term_entropy_reg: f32,
    /// Weight of the proposal entropy in the regularisation loss.
    pub proposal_entropy_reg: f32,
    /// Width of embeddings, recurrent state, and the combined hidden vector.
    pub embedding_size: usize,
    /// Utterance vocabulary size.
    pub num_tokens: usize,
    /// Fixed utterance length.
    pub utterance_len: usize,
    /// Number of possible counts per negotiable item.
    pub num_counts: usize,
    /// Number of negotiable items per proposal.
    pub num_items: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enable_comms: true,
            enable_proposal: true,
            term_entropy_reg: 0.05,
            proposal_entropy_reg: 0.05,
            embedding_size: 100,
            num_tokens: 10,
            utterance_len: 6,
            num_counts: 6,
            num_items: 3,
        }
    }
}

impl AgentConfig {
    /// Fails fast on configurations the model cannot honour.
    pub fn validate(&self) -> AgentResult<()> {
        if self.embedding_size == 0 {
            return Err(AgentError::InvalidConfig {
                reason: "embedding_size must be non-zero",
            });
        }
        if self.num_tokens == 0 || self.utterance_len == 0 {
            return Err(AgentError::InvalidConfig {
                reason: "utterance vocabulary and length must be non-zero",
            });
        }
        if self.num_counts == 0 || self.num_items == 0 {
            return Err(AgentError::InvalidConfig {
                reason: "proposal counts and items must be non-zero",
            });
        }
        // Previous proposals are re-encoded through the digit vocabulary, so
        // every sampleable count must be a valid encoder token.
        if self.num_counts > ENCODER_VOCAB {
            return Err(AgentError::InvalidConfig {
                reason: "num_counts may not exceed the encoder vocabulary of 11",
            });
        }
        if self.num_tokens > ENCODER_VOCAB {
            return Err(AgentError::InvalidConfig {
                reason: "num_tokens may not exceed the encoder vocabulary of 11",
            });
        }
        if !self.term_entropy_reg.is_finite()
            || !self.proposal_entropy_reg.is_finite()
            || self.term_entropy_reg < 0.0
            || self.proposal_entropy_reg < 0.0
        {
            return Err(AgentError::InvalidConfig {
                reason: "entropy regularisation weights must be finite and non-negative",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_shapes_and_weights() {
        let mut config = AgentConfig {
            embedding_size: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());

        config.embedding_size = 16;
        config.num_counts = 12;
        assert!(config.validate().is_err());

        config.num_counts = 6;
        config.term_entropy_reg = -0.1;
        assert!(config.validate().is_err());
    }
}
