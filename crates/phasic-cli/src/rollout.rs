//! Synthetic one-step rollouts for a contextual bandit.
//!
//! Each row is an independent episode: the observation is gaussian noise and
//! the reward is 1 when the sampled action indexes the largest of the first
//! `num_actions` observation features.

use phasic::batch::{
    ACTIONS, ACTION_DIST_INPUTS, ACTION_LOGP, ADVANTAGES, DONES, OBS, REWARDS, VALUE_TARGETS,
    VF_PREDS,
};
use phasic::prelude::*;
use tch::{Device, Kind, Tensor};

/// Collect `rows` one-step episodes with `policy`. Returns the batch and its mean reward.
pub fn collect(
    policy: &MlpAuxPolicy,
    rows: i64,
    obs_size: i64,
    num_actions: i64,
) -> phasic::Result<(SampleBatch, f64)> {
    let obs = Tensor::randn([rows, obs_size], (Kind::Float, Device::Cpu));

    let (logits, values, actions, log_probs) = tch::no_grad(|| -> phasic::Result<_> {
        let (logits, values) = policy.forward_policy(&obs);
        let dist = policy.dist_kind().distribution(&logits)?;
        let actions = dist.sample();
        let log_probs = dist.log_prob(&actions);
        Ok((logits, values, actions, log_probs))
    })?;

    let best = obs.f_narrow(1, 0, num_actions)?.argmax(-1, false);
    let rewards = actions
        .to_device(Device::Cpu)
        .eq_tensor(&best)
        .to_kind(Kind::Float);
    let values = values.to_device(Device::Cpu);
    let mean_reward = rewards.f_mean(Kind::Float)?.f_double_value(&[])?;

    // Single-step episodes: the return is the reward.
    let batch = SampleBatch::from_fields([
        (OBS, obs),
        (ACTIONS, actions.to_device(Device::Cpu)),
        (REWARDS, rewards.shallow_clone()),
        (DONES, Tensor::ones([rows], (Kind::Float, Device::Cpu))),
        (ACTION_LOGP, log_probs.to_device(Device::Cpu)),
        (ACTION_DIST_INPUTS, logits.to_device(Device::Cpu)),
        (VF_PREDS, values.shallow_clone()),
        (ADVANTAGES, &rewards - &values),
        (VALUE_TARGETS, rewards),
    ])?;
    Ok((batch, mean_reward))
}
