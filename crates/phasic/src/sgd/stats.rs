//! Batch statistics: learner stat accumulation, averaging and standardization.

use crate::{PhasicError, Result};
use ndarray::{arr0, ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tch::{Kind, Tensor};

/// Minimum standard deviation used by [`standardized`]
pub const STD_FLOOR: f64 = 1e-4;

/// A statistic reported by a learner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Scalar(f64),
    Array(ArrayD<f64>),
    Nested(Stats),
}

/// Named statistics
pub type Stats = BTreeMap<String, StatValue>;

impl StatValue {
    /// Read a tensor into a scalar (0-d) or an array value
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        if shape.is_empty() {
            return Ok(StatValue::Scalar(tensor.f_double_value(&[])?));
        }
        let flat = tensor
            .f_to_kind(Kind::Double)?
            .f_flatten(0, -1)?
            .f_to_device(tch::Device::Cpu)?;
        let data = Vec::<f64>::try_from(&flat)?;
        let array = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| {
            PhasicError::ShapeMismatch {
                expected: shape.clone(),
                actual: vec![flat.size()[0] as usize],
            }
        })?;
        Ok(StatValue::Array(array))
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            StatValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&Stats> {
        match self {
            StatValue::Nested(s) => Some(s),
            _ => None,
        }
    }

    fn to_array(&self) -> Option<ArrayD<f64>> {
        match self {
            StatValue::Scalar(v) => Some(arr0(*v).into_dyn()),
            StatValue::Array(a) => Some(a.clone()),
            StatValue::Nested(_) => None,
        }
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Scalar(v)
    }
}

impl From<f32> for StatValue {
    fn from(v: f32) -> Self {
        StatValue::Scalar(v as f64)
    }
}

impl From<ArrayD<f64>> for StatValue {
    fn from(v: ArrayD<f64>) -> Self {
        StatValue::Array(v)
    }
}

impl From<Stats> for StatValue {
    fn from(v: Stats) -> Self {
        StatValue::Nested(v)
    }
}

/// Per-key lists of statistics, in first-insertion order
#[derive(Clone, Debug, Default)]
pub struct StatLists {
    entries: Vec<(String, Vec<StatValue>)>,
}

impl StatLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` to the list for `key`
    pub fn push(&mut self, key: &str, value: StatValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key.to_string(), vec![value])),
        }
    }

    /// Append every entry of `stats`
    pub fn extend_from(&mut self, stats: &Stats) {
        for (k, v) in stats {
            self.push(k, v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&[StatValue]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[StatValue])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Average the value lists of `kv`.
///
/// Numeric lists are averaged over `axis` of the stacked values (`None` means
/// every element). A list whose first value is a nested mapping is reduced to
/// that first value.
pub fn averaged(kv: &StatLists, axis: Option<usize>) -> Result<Stats> {
    let mut out = Stats::new();
    for (key, values) in kv.iter() {
        let Some(first) = values.first() else {
            continue;
        };
        let value = match first {
            StatValue::Nested(_) => first.clone(),
            _ => mean(values, axis)?,
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn mean(values: &[StatValue], axis: Option<usize>) -> Result<StatValue> {
    let arrays = values
        .iter()
        .map(|v| {
            v.to_array()
                .ok_or_else(|| PhasicError::TrainingError("cannot average nested stats".into()))
        })
        .collect::<Result<Vec<_>>>()?;

    let shape = arrays[0].shape().to_vec();
    if let Some(bad) = arrays.iter().find(|a| a.shape() != shape.as_slice()) {
        return Err(PhasicError::ShapeMismatch {
            expected: shape,
            actual: bad.shape().to_vec(),
        });
    }

    let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
    let stacked = ndarray::stack(Axis(0), &views).map_err(|_| PhasicError::ShapeMismatch {
        expected: shape.clone(),
        actual: shape.clone(),
    })?;

    match axis {
        None => Ok(StatValue::Scalar(stacked.mean().unwrap_or(f64::NAN))),
        Some(axis) if axis < stacked.ndim() => {
            let reduced = stacked
                .mean_axis(Axis(axis))
                .ok_or_else(|| PhasicError::TrainingError("mean over an empty axis".into()))?;
            if reduced.ndim() == 0 {
                Ok(StatValue::Scalar(reduced.iter().copied().next().unwrap_or(f64::NAN)))
            } else {
                Ok(StatValue::Array(reduced))
            }
        }
        Some(axis) => Err(PhasicError::ShapeMismatch {
            expected: vec![axis + 1],
            actual: vec![stacked.ndim()],
        }),
    }
}

/// Shift and scale `array` to zero mean and unit standard deviation.
///
/// The population standard deviation is floored at [`STD_FLOOR`], so constant
/// input maps to zeros instead of overflowing.
pub fn standardized(array: &Tensor) -> Tensor {
    let x = if array.is_floating_point() {
        array.shallow_clone()
    } else {
        array.to_kind(Kind::Float)
    };
    let mean = x.mean(x.kind());
    let std = x.std(false).clamp_min(STD_FLOOR);
    (&x - mean) / std
}
