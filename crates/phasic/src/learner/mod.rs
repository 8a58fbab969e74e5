//! Learner interface used by the main phase, and a clipped PPO reference learner.

mod ppo;

pub use ppo::{kl_divergence, ppo_policy_loss, PpoConfig, PpoLearner};

use crate::batch::{MultiAgentBatch, PolicyId};
use crate::sgd::Stats;
use crate::Result;
use std::collections::BTreeMap;
use tch::Tensor;

/// Policies keyed by id
pub type PolicyMap<P> = BTreeMap<PolicyId, P>;

/// What a learner reports for one policy after one gradient step
#[derive(Debug)]
pub struct LearnerFetches {
    /// Value targets of the minibatch rows
    pub vtarg: Tensor,
    /// Distribution inputs of the minibatch rows
    pub oldpd: Tensor,
    /// Done flags of the minibatch rows
    pub dones: Tensor,
    /// Per-step statistics, averaged per epoch by the optimizer
    pub learner_stats: Stats,
}

/// Applies one gradient step per policy present in a minibatch
pub trait Learner<P> {
    fn learn_on_batch(
        &mut self,
        policies: &mut PolicyMap<P>,
        batch: &MultiAgentBatch,
    ) -> Result<BTreeMap<PolicyId, LearnerFetches>>;
}
