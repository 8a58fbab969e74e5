//! Sample batch containers.
//!
//! A `SampleBatch` is an ordered set of named tensor columns that all share the
//! same leading dimension. A `MultiAgentBatch` routes one `SampleBatch` per
//! policy through a shared learner.

use crate::{dims, PhasicError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use tch::{Device, Tensor};

/// Identifier of a policy inside a multi-agent batch
pub type PolicyId = String;

/// Policy id used when a single-policy batch is promoted to a multi-agent one
pub const DEFAULT_POLICY_ID: &str = "default_policy";

pub const OBS: &str = "obs";
pub const ACTIONS: &str = "actions";
pub const REWARDS: &str = "rewards";
pub const DONES: &str = "dones";
pub const ACTION_LOGP: &str = "action_logp";
pub const ACTION_DIST_INPUTS: &str = "action_dist_inputs";
pub const VF_PREDS: &str = "vf_preds";
pub const ADVANTAGES: &str = "advantages";
pub const VALUE_TARGETS: &str = "value_targets";

/// First recurrent state column. Its presence marks sequence data that must
/// keep its row order.
pub const STATE_IN_0: &str = "state_in_0";

/// Flat collection of equal-length tensor columns
#[derive(Debug, Default)]
pub struct SampleBatch {
    data: BTreeMap<String, Tensor>,
    count: usize,
}

impl SampleBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from `(name, tensor)` pairs
    pub fn from_fields<K, I>(fields: I) -> Result<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Tensor)>,
    {
        let mut batch = Self::new();
        for (key, value) in fields {
            batch.insert(key, value)?;
        }
        Ok(batch)
    }

    /// Insert or replace a column.
    ///
    /// The first column fixes `count`; every later column must have the same
    /// leading dimension.
    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) -> Result<Option<Tensor>> {
        let key = key.into();
        let len = leading_dim(&value)?;
        let sole_column = self.data.len() == 1 && self.data.contains_key(&key);
        if self.data.is_empty() || sole_column {
            self.count = len;
        } else if len != self.count {
            return Err(PhasicError::ShapeMismatch {
                expected: vec![self.count],
                actual: vec![len],
            });
        }
        Ok(self.data.insert(key, value))
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.data.get(key)
    }

    /// Like `get`, but a missing column is an error
    pub fn field(&self, key: &str) -> Result<&Tensor> {
        self.data
            .get(key)
            .ok_or_else(|| PhasicError::MissingField(key.to_string()))
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        let removed = self.data.remove(key);
        if self.data.is_empty() {
            self.count = 0;
        }
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of rows
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Permute the rows of every column with one shared permutation
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let mut perm: Vec<i64> = (0..self.count as i64).collect();
        perm.shuffle(rng);
        let perm = Tensor::from_slice(&perm);

        for value in self.data.values_mut() {
            let indices = perm.to_device(value.device());
            *value = value.f_index_select(0, &indices)?;
        }
        Ok(())
    }

    /// Rows `[start, end)` as views into this batch. `end` is clamped to `count`.
    pub fn slice(&self, start: usize, end: usize) -> SampleBatch {
        let end = end.min(self.count);
        let start = start.min(end);
        let len = (end - start) as i64;

        SampleBatch {
            data: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.narrow(0, start as i64, len)))
                .collect(),
            count: end - start,
        }
    }

    /// A batch sharing storage with this one
    pub fn shallow_copy(&self) -> SampleBatch {
        SampleBatch {
            data: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.shallow_clone()))
                .collect(),
            count: self.count,
        }
    }

    pub fn to_device(&self, device: Device) -> SampleBatch {
        SampleBatch {
            data: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_device(device)))
                .collect(),
            count: self.count,
        }
    }
}

fn leading_dim(value: &Tensor) -> Result<usize> {
    match value.size().first() {
        Some(&len) => Ok(len as usize),
        None => Err(PhasicError::ShapeMismatch {
            expected: vec![1],
            actual: dims(value),
        }),
    }
}

/// Per-policy sample batches
#[derive(Debug, Default)]
pub struct MultiAgentBatch {
    policy_batches: BTreeMap<PolicyId, SampleBatch>,
    count: usize,
}

impl MultiAgentBatch {
    pub fn new(policy_batches: BTreeMap<PolicyId, SampleBatch>, count: usize) -> Self {
        Self {
            policy_batches,
            count,
        }
    }

    /// A multi-agent batch holding a single policy's rows
    pub fn single(policy_id: impl Into<PolicyId>, batch: SampleBatch) -> Self {
        let count = batch.count();
        let mut policy_batches = BTreeMap::new();
        policy_batches.insert(policy_id.into(), batch);
        Self {
            policy_batches,
            count,
        }
    }

    pub fn policy_batches(&self) -> &BTreeMap<PolicyId, SampleBatch> {
        &self.policy_batches
    }

    pub fn get(&self, policy_id: &str) -> Option<&SampleBatch> {
        self.policy_batches.get(policy_id)
    }

    pub fn remove(&mut self, policy_id: &str) -> Option<SampleBatch> {
        self.policy_batches.remove(policy_id)
    }

    pub fn contains_policy(&self, policy_id: &str) -> bool {
        self.policy_batches.contains_key(policy_id)
    }

    /// Total environment steps across all policies
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Either kind of batch, as accepted by the optimizer entry points
#[derive(Debug)]
pub enum Batch {
    Single(SampleBatch),
    Multi(MultiAgentBatch),
}

impl Batch {
    pub fn count(&self) -> usize {
        match self {
            Batch::Single(b) => b.count(),
            Batch::Multi(b) => b.count(),
        }
    }

    /// Promote to a multi-agent batch, filing single batches under `DEFAULT_POLICY_ID`
    pub fn into_multi_agent(self) -> MultiAgentBatch {
        match self {
            Batch::Single(b) => MultiAgentBatch::single(DEFAULT_POLICY_ID, b),
            Batch::Multi(b) => b,
        }
    }
}

impl From<SampleBatch> for Batch {
    fn from(batch: SampleBatch) -> Self {
        Batch::Single(batch)
    }
}

impl From<MultiAgentBatch> for Batch {
    fn from(batch: MultiAgentBatch) -> Self {
        Batch::Multi(batch)
    }
}
