//! # Phasic
//!
//! Two-phase minibatch policy optimization in Rust.
//!
//! ## Overview
//!
//! Phasic provides:
//! - Sample batch containers (`SampleBatch`, `MultiAgentBatch`) over `tch` tensors
//! - Shuffled fixed-size minibatching for the main policy-gradient phase
//! - Segment retention and cross-segment minibatching for the auxiliary phase
//! - `PhasicOptimizer`, which runs the main epochs through a `Learner` and then
//!   distills the policy toward its pre-update outputs while fitting an auxiliary
//!   value head
//! - A reference MLP policy with an auxiliary value head and a clipped PPO learner
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phasic::prelude::*;
//! use std::collections::BTreeMap;
//!
//! let device = tch::Device::Cpu;
//! let policy = MlpAuxPolicy::new(8, 4, DistKind::Categorical, MlpAuxConfig::default(), device)?;
//! let mut policies = BTreeMap::from([(DEFAULT_POLICY_ID.to_string(), policy)]);
//! let mut learner = PpoLearner::new(PpoConfig::default());
//!
//! let config = SgdConfig::default()
//!     .with_sgd_minibatch_size(64)
//!     .with_num_env_slots(64);
//! let mut optimizer = PhasicOptimizer::new(config)?;
//! let fetches = optimizer.do_minibatch_sgd(rollout, &mut policies, &mut learner)?;
//! ```

pub mod batch;
pub mod learner;
pub mod log_once;
pub mod policy;
pub mod sgd;
pub mod tree;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{Batch, MultiAgentBatch, PolicyId, SampleBatch, DEFAULT_POLICY_ID};
    pub use crate::learner::{Learner, LearnerFetches, PolicyMap, PpoConfig, PpoLearner};
    pub use crate::policy::{
        Activation, AuxModel, AuxOutput, AuxPolicy, DistKind, Distribution, MlpAuxConfig,
        MlpAuxPolicy,
    };
    pub use crate::sgd::{
        averaged, make_minibatches, minibatches, smallest_minibatch, standardized, Fetches,
        PhasicOptimizer, Segment, SegmentPool, SgdConfig, StatLists, StatValue, Stats,
        AUX_STATS_KEY,
    };
    pub use crate::tree::{minibatched_call, TensorTree};
    pub use crate::{PhasicError, Result};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum PhasicError {
    #[error("Unsupported input: {0}")]
    UnsupportedInputKind(String),

    #[error("Learner failed for policy {policy_id}: {source}")]
    LearnerFailure {
        policy_id: String,
        #[source]
        source: Box<PhasicError>,
    },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Cannot stack an empty list of trees")]
    EmptyStack,

    #[error("Distribution mismatch: cannot compare {0} with {1}")]
    DistributionMismatch(&'static str, &'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    TensorError(#[from] tch::TchError),
}

pub type Result<T> = core::result::Result<T, PhasicError>;

/// Shape of a tensor as `usize` dimensions, for error reporting.
pub(crate) fn dims(tensor: &tch::Tensor) -> Vec<usize> {
    tensor.size().iter().map(|&d| d.max(0) as usize).collect()
}
