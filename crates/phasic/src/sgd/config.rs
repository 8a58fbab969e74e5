//! Optimizer configuration.

use crate::batch::ADVANTAGES;
use crate::{PhasicError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::Device;

/// Configuration for the two-phase optimizer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    // Main phase
    /// Number of epochs over each policy's batch
    pub num_sgd_iter: usize,
    /// Rows per main-phase minibatch (0 = whole batch)
    pub sgd_minibatch_size: usize,
    /// Fields normalized to zero mean and unit variance before the main phase
    pub standardize_fields: Vec<String>,

    // Auxiliary phase
    /// Number of auxiliary epochs
    pub aux_epochs: usize,
    /// Rows per cross-segment minibatch
    pub aux_minibatch_size: usize,
    /// Chunk size of the forward pass that refreshes distillation targets
    pub aux_forward_batch_size: usize,
    /// Environment slots per segment used to build the cross-segment index
    /// space. Every segment must have at least this many rows.
    pub num_env_slots: usize,

    // Random seed
    pub seed: u64,

    // Device
    /// Device that segments and auxiliary minibatches are moved to
    #[serde(skip, default = "default_device")]
    pub device: Device,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            num_sgd_iter: 1,
            sgd_minibatch_size: 1024,
            standardize_fields: vec![ADVANTAGES.to_string()],

            aux_epochs: 16,
            aux_minibatch_size: 512,
            aux_forward_batch_size: 512,
            num_env_slots: 1024,

            seed: 42,
            device: Device::Cpu,
        }
    }
}

impl SgdConfig {
    /// Load a JSON config file. Missing fields take their default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.aux_minibatch_size == 0 {
            return Err(PhasicError::InvalidConfig(
                "aux_minibatch_size must be positive".to_string(),
            ));
        }
        if self.aux_forward_batch_size == 0 {
            return Err(PhasicError::InvalidConfig(
                "aux_forward_batch_size must be positive".to_string(),
            ));
        }
        if self.num_env_slots == 0 {
            return Err(PhasicError::InvalidConfig(
                "num_env_slots must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Use the first CUDA device
    pub fn cuda(mut self) -> Self {
        self.device = Device::Cuda(0);
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_num_sgd_iter(mut self, epochs: usize) -> Self {
        self.num_sgd_iter = epochs;
        self
    }

    pub fn with_sgd_minibatch_size(mut self, size: usize) -> Self {
        self.sgd_minibatch_size = size;
        self
    }

    pub fn with_standardize_fields<S: Into<String>>(
        mut self,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        self.standardize_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aux_epochs(mut self, epochs: usize) -> Self {
        self.aux_epochs = epochs;
        self
    }

    pub fn with_aux_minibatch_size(mut self, size: usize) -> Self {
        self.aux_minibatch_size = size;
        self
    }

    pub fn with_aux_forward_batch_size(mut self, size: usize) -> Self {
        self.aux_forward_batch_size = size;
        self
    }

    pub fn with_num_env_slots(mut self, slots: usize) -> Self {
        self.num_env_slots = slots;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
