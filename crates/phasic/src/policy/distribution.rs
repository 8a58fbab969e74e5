//! Probability distributions for RL policies.

use crate::{dims, PhasicError, Result};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

/// Distribution family, used to build a `Distribution` from model outputs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistKind {
    /// Categorical over the logits
    Categorical,
    /// Diagonal gaussian; inputs are the concatenation `[mean, log_std]`
    DiagGaussian,
}

impl DistKind {
    /// Number of model outputs needed for an action of size `action_dim`
    pub fn required_inputs(&self, action_dim: i64) -> i64 {
        match self {
            DistKind::Categorical => action_dim,
            DistKind::DiagGaussian => action_dim * 2,
        }
    }

    pub fn distribution(&self, inputs: &Tensor) -> Result<Distribution> {
        match self {
            DistKind::Categorical => Ok(Distribution::Categorical {
                logits: inputs.shallow_clone(),
            }),
            DistKind::DiagGaussian => {
                let last = inputs.size().last().copied().unwrap_or(0);
                if last % 2 != 0 {
                    return Err(PhasicError::ShapeMismatch {
                        expected: vec![(last + 1) as usize],
                        actual: dims(inputs),
                    });
                }
                let halves = inputs.f_chunk(2, -1)?;
                // log_std clamped for stability
                let log_std = halves[1].clamp(-20.0, 2.0);
                Ok(Distribution::Gaussian {
                    mean: halves[0].shallow_clone(),
                    std: log_std.exp(),
                })
            }
        }
    }
}

/// Action distribution
#[derive(Debug)]
pub enum Distribution {
    Categorical { logits: Tensor },
    Gaussian { mean: Tensor, std: Tensor },
}

impl Distribution {
    fn name(&self) -> &'static str {
        match self {
            Distribution::Categorical { .. } => "categorical",
            Distribution::Gaussian { .. } => "gaussian",
        }
    }

    /// Sample raw actions from the distribution
    pub fn sample(&self) -> Tensor {
        match self {
            Distribution::Categorical { logits } => logits
                .softmax(-1, Kind::Float)
                .multinomial(1, true)
                .squeeze_dim(-1),
            Distribution::Gaussian { mean, std } => {
                let noise = Tensor::randn_like(mean);
                mean + noise * std
            }
        }
    }

    /// Log probabilities of `actions`
    pub fn log_prob(&self, actions: &Tensor) -> Tensor {
        match self {
            Distribution::Categorical { logits } => {
                let log_probs = logits.log_softmax(-1, Kind::Float);
                let indices = if actions.dim() == log_probs.dim() {
                    actions.to_kind(Kind::Int64)
                } else {
                    actions.unsqueeze(-1).to_kind(Kind::Int64)
                };
                log_probs.gather(-1, &indices, false).squeeze_dim(-1)
            }
            Distribution::Gaussian { mean, std } => {
                let var = std.pow_tensor_scalar(2.0);
                let log_2pi = (2.0 * std::f64::consts::PI).ln();
                let sq_diff = (actions - mean).pow_tensor_scalar(2.0);
                let element_wise = (sq_diff / (var + 1e-8) + std.log() * 2.0 + log_2pi) * -0.5;
                element_wise.sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float)
            }
        }
    }

    /// Entropy per sample
    pub fn entropy(&self) -> Tensor {
        match self {
            Distribution::Categorical { logits } => {
                let probs = logits.softmax(-1, Kind::Float);
                let log_probs = logits.log_softmax(-1, Kind::Float);
                -(probs * log_probs).sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float)
            }
            Distribution::Gaussian { std, .. } => {
                let entropy = std.log() + 0.5 + 0.5 * (2.0 * std::f64::consts::PI).ln();
                entropy.sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float)
            }
        }
    }

    /// KL divergence `KL(self || other)` per sample
    pub fn kl(&self, other: &Distribution) -> Result<Tensor> {
        match (self, other) {
            (Distribution::Categorical { logits: p }, Distribution::Categorical { logits: q }) => {
                let logp = p.log_softmax(-1, Kind::Float);
                let logq = q.log_softmax(-1, Kind::Float);
                let kl = logp.exp() * (&logp - logq);
                Ok(kl.sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float))
            }
            (
                Distribution::Gaussian { mean: m1, std: s1 },
                Distribution::Gaussian { mean: m2, std: s2 },
            ) => {
                let var1 = s1.pow_tensor_scalar(2.0);
                let var2 = s2.pow_tensor_scalar(2.0);
                let kl = (s2 / s1).log() + (var1 + (m1 - m2).pow_tensor_scalar(2.0)) / (var2 * 2.0)
                    - 0.5;
                Ok(kl.sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float))
            }
            _ => Err(PhasicError::DistributionMismatch(self.name(), other.name())),
        }
    }
}
