// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of BarterTorch — Licensed under AGPL-3.0-or-later.

use crate::config::{AgentConfig, ENCODER_VOCAB};
use crate::encoder::SequenceEncoder;
use crate::policy::{ProposalPolicy, TermPolicy, UtterancePolicy};
use crate::sample::SampleNode;
use crate::{AgentError, AgentResult, PureResult, Tensor};
use bt_nn::{Linear, Module, Parameter, Relu};
use rand::Rng;
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Concatenates the three encoder summaries and projects them through one
/// rectified linear layer into the shared hidden representation.
pub struct CombinedNet {
    h1: Linear,
    relu: Relu,
    cache: RefCell<Option<(Tensor, Tensor)>>,
}

impl CombinedNet {
    pub fn gaussian<R: Rng>(embedding_size: usize, rng: &mut R) -> PureResult<Self> {
        Ok(Self {
            h1: Linear::gaussian("combined_net::h1", embedding_size * 3, embedding_size, rng)?,
            relu: Relu::new(),
            cache: RefCell::new(None),
        })
    }

    fn forward(&self, parts: [&Tensor; 3]) -> PureResult<Tensor> {
        let concat = Tensor::concat_cols(&parts)?;
        let pre = self.h1.forward(&concat)?;
        let hidden = self.relu.forward(&pre)?;
        *self.cache.borrow_mut() = Some((concat, pre));
        Ok(hidden)
    }

    fn backward(&mut self, grad_hidden: &Tensor) -> PureResult<Tensor> {
        let (concat, pre) = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(bt_tensor::TensorError::InvalidValue {
                label: "combined_net backward without a cached forward",
            })?;
        let grad_pre = self.relu.backward(&pre, grad_hidden)?;
        self.h1.backward(&concat, &grad_pre)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.h1.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.h1.visit_parameters_mut(visitor)
    }
}

/// Everything one forward pass of the agent produced.
pub struct AgentForward {
    /// Termination decision (distribution rows are `[p_continue, p_stop]`).
    pub term: SampleNode,
    /// Per-step utterance sample nodes; empty when comms are disabled.
    pub utterance_nodes: Vec<SampleNode>,
    /// Assembled `(batch, utterance_len)` token tensor; all-zero when comms
    /// are disabled.
    pub utterance: Tensor,
    /// Per-item proposal sample nodes.
    pub proposal_nodes: Vec<SampleNode>,
    /// Assembled `(batch, num_items)` count tensor.
    pub proposal: Tensor,
    /// `-(term_entropy_reg · H_term + proposal_entropy_reg · H_proposal)`.
    pub entropy_loss: f32,
    pub term_entropy: f32,
    /// Reported but not folded into `entropy_loss`; weighting it is a
    /// caller decision.
    pub utterance_entropy: f32,
    pub proposal_entropy: f32,
    hidden: Tensor,
}

impl AgentForward {
    /// The shared hidden representation the three policies consumed.
    pub fn hidden(&self) -> &Tensor {
        &self.hidden
    }
}

/// Per-example score-function weights (advantages) for one backward pass.
pub struct ReinforceWeights {
    pub term: Vec<f32>,
    pub utterance: Vec<f32>,
    pub proposal: Vec<f32>,
}

impl ReinforceWeights {
    /// Applies the same weight to every branch and batch row.
    pub fn broadcast(batch: usize, weight: f32) -> Self {
        Self {
            term: vec![weight; batch],
            utterance: vec![weight; batch],
            proposal: vec![weight; batch],
        }
    }
}

/// The negotiation agent: three sequence encoders, a combiner, and the
/// termination / utterance / proposal policies.
pub struct AgentModel {
    config: AgentConfig,
    context_net: SequenceEncoder,
    message_net: SequenceEncoder,
    proposal_net: SequenceEncoder,
    combined_net: CombinedNet,
    term_policy: TermPolicy,
    utterance_policy: UtterancePolicy,
    proposal_policy: ProposalPolicy,
}

impl AgentModel {
    /// Builds the model with Gaussian parameters drawn from the caller's RNG.
    ///
    /// The proposal encoder reads the context encoder's embedding table
    /// through a shared handle; the two never diverge.
    pub fn new<R: Rng>(config: AgentConfig, rng: &mut R) -> AgentResult<Self> {
        config.validate()?;
        let embedding = config.embedding_size;
        let context_net = SequenceEncoder::new("context_net", ENCODER_VOCAB, embedding, rng)?;
        let message_net = SequenceEncoder::new("message_net", ENCODER_VOCAB, embedding, rng)?;
        let proposal_net = SequenceEncoder::with_shared_embedding(
            "proposal_net",
            context_net.embedding_handle(),
            rng,
        )?;
        let combined_net = CombinedNet::gaussian(embedding, rng)?;
        let term_policy = TermPolicy::gaussian(embedding, rng)?;
        let utterance_policy =
            UtterancePolicy::gaussian(embedding, config.num_tokens, config.utterance_len, rng)?;
        let proposal_policy =
            ProposalPolicy::gaussian(embedding, config.num_counts, config.num_items, rng)?;
        Ok(Self {
            config,
            context_net,
            message_net,
            proposal_net,
            combined_net,
            term_policy,
            utterance_policy,
            proposal_policy,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn guard_inputs(
        &self,
        context: &Tensor,
        m_prev: &Tensor,
        prev_proposal: &Tensor,
    ) -> AgentResult<()> {
        let (context_batch, _) = context.shape();
        let (message_batch, message_len) = m_prev.shape();
        let (proposal_batch, proposal_len) = prev_proposal.shape();
        if context_batch != message_batch || context_batch != proposal_batch {
            return Err(AgentError::BatchMismatch {
                context: context_batch,
                message: message_batch,
                proposal: proposal_batch,
            });
        }
        if message_len != self.config.utterance_len {
            return Err(AgentError::InputWidth {
                name: "m_prev",
                expected: self.config.utterance_len,
                got: message_len,
            });
        }
        if proposal_len != self.config.num_items {
            return Err(AgentError::InputWidth {
                name: "prev_proposal",
                expected: self.config.num_items,
                got: proposal_len,
            });
        }
        Ok(())
    }

    /// Runs one negotiation turn: encode, combine, and sample a termination
    /// decision, an utterance, and a proposal.
    pub fn forward<R: Rng>(
        &self,
        context: &Tensor,
        m_prev: &Tensor,
        prev_proposal: &Tensor,
        rng: &mut R,
    ) -> AgentResult<AgentForward> {
        self.guard_inputs(context, m_prev, prev_proposal)?;
        let batch = context.shape().0;
        debug!(
            batch,
            enable_comms = self.config.enable_comms,
            "encoding negotiation inputs"
        );

        let c_h = self.context_net.forward(context)?;
        let m_h = if self.config.enable_comms {
            self.message_net.forward(m_prev)?
        } else {
            Tensor::zeros(batch, self.config.embedding_size)?
        };
        let p_h = self.proposal_net.forward(prev_proposal)?;
        let hidden = self.combined_net.forward([&c_h, &m_h, &p_h])?;

        let (term, term_entropy) = self.term_policy.forward(&hidden, rng)?;

        let (utterance_nodes, utterance, utterance_entropy) = if self.config.enable_comms {
            let out = self.utterance_policy.forward(&hidden, rng)?;
            (out.nodes, out.tokens, out.entropy)
        } else {
            (
                Vec::new(),
                Tensor::zeros(batch, self.config.utterance_len)?,
                0.0,
            )
        };

        let (proposal_nodes, proposal, proposal_entropy) =
            self.proposal_policy.forward(&hidden, rng)?;

        let entropy_loss = -(self.config.term_entropy_reg * term_entropy
            + self.config.proposal_entropy_reg * proposal_entropy);
        trace!(
            term_entropy,
            utterance_entropy,
            proposal_entropy,
            entropy_loss,
            "sampled negotiation actions"
        );

        Ok(AgentForward {
            term,
            utterance_nodes,
            utterance,
            proposal_nodes,
            proposal,
            entropy_loss,
            term_entropy,
            utterance_entropy,
            proposal_entropy,
            hidden,
        })
    }

    /// Accumulates score-function gradients for every branch of the most
    /// recent forward pass and propagates them through the combiner and the
    /// encoders.
    pub fn backward(&mut self, forward: &AgentForward, weights: &ReinforceWeights) -> AgentResult<()> {
        let batch = forward.hidden.shape().0;
        for (name, branch) in [
            ("term", &weights.term),
            ("proposal", &weights.proposal),
        ] {
            if branch.len() != batch {
                return Err(AgentError::WeightLength {
                    name,
                    expected: batch,
                    got: branch.len(),
                });
            }
        }

        let mut grad_hidden =
            self.term_policy
                .backward(&forward.hidden, &forward.term, &weights.term)?;
        if !forward.utterance_nodes.is_empty() {
            if weights.utterance.len() != batch {
                return Err(AgentError::WeightLength {
                    name: "utterance",
                    expected: batch,
                    got: weights.utterance.len(),
                });
            }
            let grad = self
                .utterance_policy
                .backward(&forward.utterance_nodes, &weights.utterance)?;
            grad_hidden.add_scaled(&grad, 1.0)?;
        }
        let grad = self.proposal_policy.backward(
            &forward.hidden,
            &forward.proposal_nodes,
            &weights.proposal,
        )?;
        grad_hidden.add_scaled(&grad, 1.0)?;

        let grad_concat = self.combined_net.backward(&grad_hidden)?;
        let embedding = self.config.embedding_size;
        let grad_context = grad_concat.col_slice(0, embedding)?;
        let grad_message = grad_concat.col_slice(embedding, 2 * embedding)?;
        let grad_proposal = grad_concat.col_slice(2 * embedding, 3 * embedding)?;

        self.context_net.backward(&grad_context)?;
        if self.config.enable_comms {
            self.message_net.backward(&grad_message)?;
        }
        self.proposal_net.backward(&grad_proposal)?;
        Ok(())
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.context_net.visit_parameters(visitor)?;
        self.message_net.visit_parameters(visitor)?;
        self.proposal_net.visit_parameters(visitor)?;
        self.combined_net.visit_parameters(visitor)?;
        self.term_policy.visit_parameters(visitor)?;
        self.utterance_policy.visit_parameters(visitor)?;
        self.proposal_policy.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.context_net.visit_parameters_mut(visitor)?;
        self.message_net.visit_parameters_mut(visitor)?;
        self.proposal_net.visit_parameters_mut(visitor)?;
        self.combined_net.visit_parameters_mut(visitor)?;
        self.term_policy.visit_parameters_mut(visitor)?;
        self.utterance_policy.visit_parameters_mut(visitor)?;
        self.proposal_policy.visit_parameters_mut(visitor)
    }

    /// Applies every accumulated gradient with the given learning rate.
    pub fn apply_step(&mut self, learning_rate: f32) -> AgentResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))?;
        Ok(())
    }

    /// Clears every gradient accumulator.
    pub fn zero_accumulators(&mut self) -> AgentResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })?;
        Ok(())
    }

    /// Captures every parameter tensor keyed by its canonical name.
    pub fn state_dict(&self) -> AgentResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters captured by [`AgentModel::state_dict`].
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> AgentResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(bt_tensor::TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> AgentConfig {
        AgentConfig {
            embedding_size: 16,
            ..AgentConfig::default()
        }
    }

    fn zero_inputs(batch: usize) -> (Tensor, Tensor, Tensor) {
        (
            Tensor::zeros(batch, 3).unwrap(),
            Tensor::zeros(batch, 6).unwrap(),
            Tensor::zeros(batch, 3).unwrap(),
        )
    }

    #[test]
    fn zero_scenario_produces_bounded_shapes() {
        let mut rng = StdRng::seed_from_u64(100);
        let model = AgentModel::new(small_config(), &mut rng).unwrap();
        let (context, m_prev, prev_proposal) = zero_inputs(1);
        let out = model
            .forward(&context, &m_prev, &prev_proposal, &mut rng)
            .unwrap();

        assert_eq!(out.term.value().shape(), (1, 1));
        assert!(out.term.indices()[0] <= 1);
        assert_eq!(out.utterance.shape(), (1, 6));
        assert!(out.utterance.data().iter().all(|&t| t >= 0.0 && t < 10.0));
        assert_eq!(out.proposal.shape(), (1, 3));
        assert!(out.proposal.data().iter().all(|&c| c >= 0.0 && c < 6.0));
        assert!(out.term_entropy >= 0.0);
        assert!(out.proposal_entropy >= 0.0);
        assert!(out.entropy_loss <= 0.0);
        assert!(out.entropy_loss.is_finite());
    }

    #[test]
    fn disabled_comms_emit_all_zero_utterances() {
        let config = AgentConfig {
            enable_comms: false,
            ..small_config()
        };
        let mut rng = StdRng::seed_from_u64(200);
        let model = AgentModel::new(config, &mut rng).unwrap();
        let (context, m_prev, prev_proposal) = zero_inputs(4);
        let out = model
            .forward(&context, &m_prev, &prev_proposal, &mut rng)
            .unwrap();
        assert!(out.utterance_nodes.is_empty());
        assert!(out.utterance.data().iter().all(|&t| t == 0.0));
        assert_eq!(out.utterance_entropy, 0.0);
        // Proposal generation stays on regardless.
        assert_eq!(out.proposal.shape(), (4, 3));
    }

    #[test]
    fn seeded_forward_is_reproducible() {
        let mut build_a = StdRng::seed_from_u64(7);
        let mut build_b = StdRng::seed_from_u64(7);
        let model_a = AgentModel::new(small_config(), &mut build_a).unwrap();
        let model_b = AgentModel::new(small_config(), &mut build_b).unwrap();
        let (context, m_prev, prev_proposal) = zero_inputs(2);

        let out_a = model_a
            .forward(&context, &m_prev, &prev_proposal, &mut StdRng::seed_from_u64(13))
            .unwrap();
        let out_b = model_b
            .forward(&context, &m_prev, &prev_proposal, &mut StdRng::seed_from_u64(13))
            .unwrap();
        assert_eq!(out_a.term.indices(), out_b.term.indices());
        assert_eq!(out_a.utterance, out_b.utterance);
        assert_eq!(out_a.proposal, out_b.proposal);
        assert_eq!(out_a.entropy_loss, out_b.entropy_loss);
    }

    #[test]
    fn batched_rows_match_solo_forward_distributions() {
        let mut rng = StdRng::seed_from_u64(17);
        let model = AgentModel::new(small_config(), &mut rng).unwrap();

        let context = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0]).unwrap();
        let m_prev =
            Tensor::from_vec(2, 6, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 1.0, 2.0])
                .unwrap();
        let prev_proposal = Tensor::from_vec(2, 3, vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]).unwrap();

        let solo_context = Tensor::from_vec(1, 3, vec![4.0, 5.0, 0.0]).unwrap();
        let solo_m_prev = Tensor::from_vec(1, 6, vec![6.0, 7.0, 8.0, 9.0, 1.0, 2.0]).unwrap();
        let solo_proposal = Tensor::from_vec(1, 3, vec![1.0, 3.0, 5.0]).unwrap();

        let batched = model
            .forward(&context, &m_prev, &prev_proposal, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let solo = model
            .forward(&solo_context, &solo_m_prev, &solo_proposal, &mut StdRng::seed_from_u64(2))
            .unwrap();

        // The distributions depend only on the parameters and the row's own
        // inputs, never on the other rows sharing the batch.
        for (b, s) in batched.term.dist().row(1).iter().zip(solo.term.dist().row(0)) {
            assert!((b - s).abs() < 1e-5);
        }
        for (batched_node, solo_node) in batched.proposal_nodes.iter().zip(&solo.proposal_nodes) {
            for (b, s) in batched_node.dist().row(1).iter().zip(solo_node.dist().row(0)) {
                assert!((b - s).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn forward_rejects_mismatched_inputs() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = AgentModel::new(small_config(), &mut rng).unwrap();
        let context = Tensor::zeros(2, 3).unwrap();
        let m_prev = Tensor::zeros(1, 6).unwrap();
        let prev_proposal = Tensor::zeros(2, 3).unwrap();
        assert!(matches!(
            model.forward(&context, &m_prev, &prev_proposal, &mut rng),
            Err(AgentError::BatchMismatch { .. })
        ));

        let short_message = Tensor::zeros(2, 4).unwrap();
        assert!(matches!(
            model.forward(&context, &short_message, &prev_proposal, &mut rng),
            Err(AgentError::InputWidth { name: "m_prev", .. })
        ));
    }

    #[test]
    fn backward_reaches_every_branch_and_steps_parameters() {
        let mut rng = StdRng::seed_from_u64(55);
        let mut model = AgentModel::new(small_config(), &mut rng).unwrap();
        let (context, m_prev, prev_proposal) = zero_inputs(2);
        let out = model
            .forward(&context, &m_prev, &prev_proposal, &mut rng)
            .unwrap();
        let weights = ReinforceWeights::broadcast(2, 0.5);
        model.backward(&out, &weights).unwrap();

        let mut with_grad = 0usize;
        let mut total = 0usize;
        model
            .visit_parameters(&mut |param| {
                total += 1;
                if param.gradient().is_some() {
                    with_grad += 1;
                }
                Ok(())
            })
            .unwrap();
        assert!(with_grad > 0);
        assert_eq!(with_grad, total);

        let before = model.state_dict().unwrap();
        model.apply_step(0.05).unwrap();
        let after = model.state_dict().unwrap();
        assert!(before.keys().any(|name| before[name] != after[name]));
    }

    #[test]
    fn state_dict_round_trips_into_a_fresh_model() {
        let mut rng_a = StdRng::seed_from_u64(21);
        let mut rng_b = StdRng::seed_from_u64(99);
        let model_a = AgentModel::new(small_config(), &mut rng_a).unwrap();
        let mut model_b = AgentModel::new(small_config(), &mut rng_b).unwrap();
        model_b.load_state_dict(&model_a.state_dict().unwrap()).unwrap();

        let (context, m_prev, prev_proposal) = zero_inputs(1);
        let out_a = model_a
            .forward(&context, &m_prev, &prev_proposal, &mut StdRng::seed_from_u64(5))
            .unwrap();
        let out_b = model_b
            .forward(&context, &m_prev, &prev_proposal, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert_eq!(out_a.utterance, out_b.utterance);
        assert_eq!(out_a.proposal, out_b.proposal);
    }
}
