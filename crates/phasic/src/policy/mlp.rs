//! Multi-layer perceptron policy with an auxiliary value head.

use super::{AuxModel, AuxOutput, AuxPolicy, DistKind};
use crate::sgd::Segment;
use crate::Result;
use serde::{Deserialize, Serialize};
use tch::nn::{self, Module, OptimizerConfig};
use tch::{Device, Kind, Tensor};

/// Configuration for MLP policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlpAuxConfig {
    /// Hidden layer size
    pub hidden_size: i64,
    /// Number of hidden layers
    pub num_layers: usize,
    pub activation: Activation,
    /// Learning rate of the main-phase optimizer
    pub learning_rate: f64,
    /// Learning rate of the auxiliary optimizer
    pub aux_learning_rate: f64,
    /// Maximum gradient norm for both optimizers
    pub max_grad_norm: f64,
}

#[derive(Clone, Debug, Copy, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Tanh,
    Gelu,
}

impl Default for MlpAuxConfig {
    fn default() -> Self {
        Self {
            hidden_size: 128,
            num_layers: 2,
            activation: Activation::ReLU,
            learning_rate: 3e-4,
            aux_learning_rate: 3e-4,
            max_grad_norm: 0.5,
        }
    }
}

/// MLP policy with policy, value and auxiliary value heads on a shared encoder
pub struct MlpAuxPolicy {
    /// Variable store for parameters
    vs: nn::VarStore,
    encoder: nn::Sequential,
    /// Actor head (distribution inputs)
    actor: nn::Linear,
    /// Critic head (value estimate)
    critic: nn::Linear,
    /// Auxiliary value head, trained only in the auxiliary phase
    aux_critic: nn::Linear,
    /// Main-phase optimizer
    optimizer: nn::Optimizer,
    /// Auxiliary-phase optimizer
    aux_optimizer: nn::Optimizer,
    dist_kind: DistKind,
    max_grad_norm: f64,
    device: Device,
}

impl MlpAuxPolicy {
    /// Create a new MLP policy with `num_actions` actions of the given family
    pub fn new(
        obs_size: i64,
        num_actions: i64,
        dist_kind: DistKind,
        config: MlpAuxConfig,
        device: Device,
    ) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let mut encoder = nn::seq();
        let mut in_size = obs_size;
        for i in 0..config.num_layers {
            encoder = encoder.add(nn::linear(
                &root / format!("encoder_{}", i),
                in_size,
                config.hidden_size,
                Default::default(),
            ));
            encoder = match config.activation {
                Activation::ReLU => encoder.add_fn(|x| x.relu()),
                Activation::Tanh => encoder.add_fn(|x| x.tanh()),
                Activation::Gelu => encoder.add_fn(|x| x.gelu("none")),
            };
            in_size = config.hidden_size;
        }

        let actor = nn::linear(
            &root / "actor",
            in_size,
            dist_kind.required_inputs(num_actions),
            Default::default(),
        );
        let critic = nn::linear(&root / "critic", in_size, 1, Default::default());
        let aux_critic = nn::linear(&root / "aux_critic", in_size, 1, Default::default());

        Self::init_weights(&vs);

        let optimizer = nn::Adam::default().build(&vs, config.learning_rate)?;
        let aux_optimizer = nn::Adam::default().build(&vs, config.aux_learning_rate)?;

        Ok(Self {
            vs,
            encoder,
            actor,
            critic,
            aux_critic,
            optimizer,
            aux_optimizer,
            dist_kind,
            max_grad_norm: config.max_grad_norm,
            device,
        })
    }

    /// Small random weights, zero biases
    fn init_weights(vs: &nn::VarStore) {
        for (name, mut var) in vs.variables() {
            tch::no_grad(|| {
                if name.contains("weight") {
                    var.copy_(&(Tensor::randn_like(&var) * 0.01));
                } else if name.contains("bias") {
                    let _ = var.zero_();
                }
            });
        }
    }

    fn features(&self, obs: &Tensor) -> Tensor {
        let obs = obs.to_device(self.device).to_kind(Kind::Float);
        self.encoder.forward(&obs)
    }

    /// Distribution inputs and value estimate, shapes `[batch, outputs]` and `[batch]`
    pub fn forward_policy(&self, obs: &Tensor) -> (Tensor, Tensor) {
        let hidden = self.features(obs);
        let logits = self.actor.forward(&hidden);
        let value = self.critic.forward(&hidden).squeeze_dim(-1);
        (logits, value)
    }

    /// Apply one main-phase optimizer step on `loss`
    pub fn learn(&mut self, loss: &Tensor) {
        let max_norm = self.max_grad_norm;
        self.optimizer.backward_step_clip_norm(loss, max_norm);
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Save policy weights to file
    pub fn save(&self, path: &str) -> Result<()> {
        Ok(self.vs.save(path)?)
    }

    /// Load policy weights from file
    pub fn load(&mut self, path: &str) -> Result<()> {
        Ok(self.vs.load(path)?)
    }

    /// Get the number of parameters
    pub fn num_parameters(&self) -> i64 {
        self.vs.variables().values().map(|v| v.numel() as i64).sum()
    }
}

impl AuxModel for MlpAuxPolicy {
    fn forward(
        &self,
        obs: &Tensor,
        _state: Option<&[Tensor]>,
        _seq_lens: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Vec<Tensor>>)> {
        let (logits, _) = self.forward_policy(obs);
        Ok((logits, None))
    }

    fn forward_aux(&self, batch: &Segment) -> Result<AuxOutput> {
        let hidden = self.features(&batch.obs);
        Ok(AuxOutput {
            logits: self.actor.forward(&hidden),
            aux_value: self.aux_critic.forward(&hidden).squeeze_dim(-1),
            value: self.critic.forward(&hidden).squeeze_dim(-1),
        })
    }
}

impl AuxPolicy for MlpAuxPolicy {
    type Model = Self;

    fn model(&self) -> &Self {
        self
    }

    fn dist_kind(&self) -> DistKind {
        self.dist_kind
    }

    fn aux_learn(&mut self, loss: &Tensor) -> Result<()> {
        let max_norm = self.max_grad_norm;
        self.aux_optimizer.backward_step_clip_norm(loss, max_norm);
        Ok(())
    }
}
