//! Policies trained by the auxiliary phase.
//!
//! Provides:
//! - `AuxModel` / `AuxPolicy` - the narrow interface the optimizer drives
//! - `Distribution` / `DistKind` - action distributions built from model outputs
//! - `MlpAuxPolicy` - MLP with policy, value and auxiliary value heads

mod distribution;
mod mlp;

pub use distribution::{DistKind, Distribution};
pub use mlp::{Activation, MlpAuxConfig, MlpAuxPolicy};

use crate::sgd::Segment;
use crate::Result;
use tch::Tensor;

/// Outputs of the auxiliary forward path
#[derive(Debug)]
pub struct AuxOutput {
    /// Distribution inputs from the policy head
    pub logits: Tensor,
    /// Prediction of the auxiliary value head, shape `[batch]`
    pub aux_value: Tensor,
    /// Prediction of the regular value head on the same forward pass, shape `[batch]`
    pub value: Tensor,
}

/// Model interface needed by the auxiliary phase
pub trait AuxModel {
    /// Policy forward pass returning distribution inputs and the next recurrent state
    fn forward(
        &self,
        obs: &Tensor,
        state: Option<&[Tensor]>,
        seq_lens: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Vec<Tensor>>)>;

    /// Auxiliary forward pass over a segment minibatch
    fn forward_aux(&self, batch: &Segment) -> Result<AuxOutput>;
}

/// Policy interface needed by the auxiliary phase
pub trait AuxPolicy {
    type Model: AuxModel;

    fn model(&self) -> &Self::Model;

    /// Distribution family built from the model's outputs
    fn dist_kind(&self) -> DistKind;

    /// Apply one auxiliary optimizer step on `loss`
    fn aux_learn(&mut self, loss: &Tensor) -> Result<()>;
}
