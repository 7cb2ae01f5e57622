// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

pub mod proposal;
pub mod term;
pub mod utterance;

pub use proposal::ProposalPolicy;
pub use term::TermPolicy;
pub use utterance::{UtteranceOutput, UtterancePolicy};

/// Additive guard inside entropy logarithms, matching the reference maths.
pub(crate) const ENTROPY_EPS: f32 = 1e-8;
