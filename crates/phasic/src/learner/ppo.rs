//! Clipped PPO learner for [`MlpAuxPolicy`].

use super::{Learner, LearnerFetches, PolicyMap};
use crate::batch::{
    MultiAgentBatch, PolicyId, SampleBatch, ACTIONS, ACTION_DIST_INPUTS, ACTION_LOGP, ADVANTAGES,
    DONES, OBS, VALUE_TARGETS,
};
use crate::policy::{AuxPolicy, MlpAuxPolicy};
use crate::sgd::{StatValue, Stats};
use crate::{PhasicError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tch::{Kind, Tensor};

/// Compute PPO clipped policy loss
pub fn ppo_policy_loss(
    advantages: &Tensor,
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    clip_coef: f64,
) -> Tensor {
    let ratio = (log_probs - old_log_probs).exp();

    let surr1 = &ratio * advantages;
    let surr2 = ratio.clamp(1.0 - clip_coef, 1.0 + clip_coef) * advantages;

    -surr1.min_other(&surr2).mean(Kind::Float)
}

/// Approximate KL divergence between old and new log probabilities
pub fn kl_divergence(log_probs: &Tensor, old_log_probs: &Tensor) -> Tensor {
    (old_log_probs - log_probs).mean(Kind::Float)
}

fn scalar(t: &Tensor) -> Result<StatValue> {
    Ok(StatValue::Scalar(t.f_double_value(&[])?))
}

/// PPO loss coefficients
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub clip_coef: f64,
    pub vf_coef: f64,
    pub ent_coef: f64,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            clip_coef: 0.2,
            vf_coef: 0.5,
            ent_coef: 0.01,
        }
    }
}

/// One clipped-surrogate step per policy batch
#[derive(Clone, Debug, Default)]
pub struct PpoLearner {
    config: PpoConfig,
}

impl PpoLearner {
    pub fn new(config: PpoConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    fn step(&self, policy: &mut MlpAuxPolicy, batch: &SampleBatch) -> Result<LearnerFetches> {
        let device = policy.device();
        let obs = batch.field(OBS)?;
        let actions = batch.field(ACTIONS)?.f_to_device(device)?;
        let advantages = batch.field(ADVANTAGES)?.f_to_device(device)?;
        let old_log_probs = batch.field(ACTION_LOGP)?.f_to_device(device)?;
        let vtarg = batch.field(VALUE_TARGETS)?;
        let dones = batch.field(DONES)?;

        let (logits, values) = policy.forward_policy(obs);
        let dist = policy.dist_kind().distribution(&logits)?;
        let log_probs = dist.log_prob(&actions);
        let entropy = dist.entropy().mean(Kind::Float);

        let policy_loss = ppo_policy_loss(
            &advantages,
            &log_probs,
            &old_log_probs,
            self.config.clip_coef,
        );
        let returns = vtarg.f_to_device(device)?.f_to_kind(Kind::Float)?;
        let value_loss = (&values - &returns).square().mean(Kind::Float) * 0.5;

        let loss =
            &policy_loss + self.config.vf_coef * &value_loss - self.config.ent_coef * &entropy;
        let approx_kl = tch::no_grad(|| kl_divergence(&log_probs, &old_log_probs));

        let mut stats = Stats::new();
        stats.insert("policy_loss".into(), scalar(&policy_loss)?);
        stats.insert("vf_loss".into(), scalar(&value_loss)?);
        stats.insert("entropy".into(), scalar(&entropy)?);
        stats.insert("kl".into(), scalar(&approx_kl)?);
        stats.insert("total_loss".into(), scalar(&loss)?);

        policy.learn(&loss);

        let oldpd = match batch.get(ACTION_DIST_INPUTS) {
            Some(inputs) => inputs.shallow_clone(),
            None => logits.detach(),
        };

        Ok(LearnerFetches {
            vtarg: vtarg.shallow_clone(),
            oldpd,
            dones: dones.shallow_clone(),
            learner_stats: stats,
        })
    }
}

impl Learner<MlpAuxPolicy> for PpoLearner {
    fn learn_on_batch(
        &mut self,
        policies: &mut PolicyMap<MlpAuxPolicy>,
        batch: &MultiAgentBatch,
    ) -> Result<BTreeMap<PolicyId, LearnerFetches>> {
        let mut fetches = BTreeMap::new();
        for (policy_id, samples) in batch.policy_batches() {
            let policy = policies
                .get_mut(policy_id)
                .ok_or_else(|| PhasicError::UnknownPolicy(policy_id.clone()))?;
            fetches.insert(policy_id.clone(), self.step(policy, samples)?);
        }
        Ok(fetches)
    }
}
