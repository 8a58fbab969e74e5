//! Operations over nested tensor structures.
//!
//! Every structure handled here is a tree whose leaves are tensors sharing a
//! leading batch dimension.

use crate::{dims, PhasicError, Result};
use std::collections::BTreeMap;
use tch::{Device, Tensor};

/// A structure of tensors with a shared leading batch dimension
pub trait TensorTree: Sized {
    /// Apply `f` to every leaf, keeping the structure
    fn map_tensors<F>(&self, f: &mut F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> Result<Tensor>;

    /// Stack trees leafwise along a new leading dimension
    fn stack(items: &[&Self]) -> Result<Self>;

    /// Concatenate trees leafwise along the leading dimension
    fn cat(items: &[&Self]) -> Result<Self>;

    /// Size of the leading dimension
    fn batch_len(&self) -> Result<usize>;

    /// Row `index` of every leaf, dropping the leading dimension
    fn slice(&self, index: usize) -> Result<Self> {
        self.map_tensors(&mut |t| Ok(t.f_select(0, index as i64)?))
    }

    /// Rows `[start, start + len)` of every leaf
    fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        self.map_tensors(&mut |t| Ok(t.f_narrow(0, start as i64, len as i64)?))
    }

    fn to_device(&self, device: Device) -> Result<Self> {
        self.map_tensors(&mut |t| Ok(t.to_device(device)))
    }
}

impl TensorTree for Tensor {
    fn map_tensors<F>(&self, f: &mut F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        f(self)
    }

    fn stack(items: &[&Self]) -> Result<Self> {
        if items.is_empty() {
            return Err(PhasicError::EmptyStack);
        }
        Ok(Tensor::f_stack(items, 0)?)
    }

    fn cat(items: &[&Self]) -> Result<Self> {
        if items.is_empty() {
            return Err(PhasicError::EmptyStack);
        }
        Ok(Tensor::f_cat(items, 0)?)
    }

    fn batch_len(&self) -> Result<usize> {
        match self.size().first() {
            Some(&len) => Ok(len as usize),
            None => Err(PhasicError::ShapeMismatch {
                expected: vec![1],
                actual: dims(self),
            }),
        }
    }
}

impl<T: TensorTree> TensorTree for BTreeMap<String, T> {
    fn map_tensors<F>(&self, f: &mut F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        let mut out = BTreeMap::new();
        for (k, v) in self {
            out.insert(k.clone(), v.map_tensors(&mut *f)?);
        }
        Ok(out)
    }

    fn stack(items: &[&Self]) -> Result<Self> {
        combine(items, T::stack)
    }

    fn cat(items: &[&Self]) -> Result<Self> {
        combine(items, T::cat)
    }

    fn batch_len(&self) -> Result<usize> {
        match self.values().next() {
            Some(first) => first.batch_len(),
            None => Ok(0),
        }
    }
}

/// Combine maps keywise; keys come from the first item
fn combine<T, F>(items: &[&BTreeMap<String, T>], op: F) -> Result<BTreeMap<String, T>>
where
    F: Fn(&[&T]) -> Result<T>,
{
    let first = items.first().ok_or(PhasicError::EmptyStack)?;
    let mut out = BTreeMap::new();
    for key in first.keys() {
        let children = items
            .iter()
            .map(|item| {
                item.get(key)
                    .ok_or_else(|| PhasicError::MissingField(key.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        out.insert(key.clone(), op(&children)?);
    }
    Ok(out)
}

/// Call `f` on consecutive chunks of at most `batch_size` rows and concatenate
/// the outputs.
///
/// An input with zero rows is passed through in a single call.
pub fn minibatched_call<I, O, F>(input: &I, batch_size: usize, mut f: F) -> Result<O>
where
    I: TensorTree,
    O: TensorTree,
    F: FnMut(&I) -> Result<O>,
{
    if batch_size == 0 {
        return Err(PhasicError::InvalidConfig(
            "minibatched_call batch_size must be positive".to_string(),
        ));
    }

    let total = input.batch_len()?;
    if total == 0 {
        return f(input);
    }

    let mut outputs = Vec::with_capacity(total.div_ceil(batch_size));
    let mut start = 0;
    while start < total {
        let len = batch_size.min(total - start);
        outputs.push(f(&input.narrow(start, len)?)?);
        start += len;
    }

    let refs: Vec<&O> = outputs.iter().collect();
    O::cat(&refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn tree(offset: f64) -> BTreeMap<String, Tensor> {
        let mut t = BTreeMap::new();
        t.insert(
            "a".to_string(),
            Tensor::arange(6, (Kind::Float, Device::Cpu)).reshape([3, 2]) + offset,
        );
        t.insert(
            "b".to_string(),
            Tensor::arange(3, (Kind::Float, Device::Cpu)) + offset,
        );
        t
    }

    #[test]
    fn test_slice_then_stack() {
        let t0 = tree(0.0);
        let t1 = tree(100.0);
        let rows = [t0.slice(2).unwrap(), t1.slice(0).unwrap()];
        let refs: Vec<_> = rows.iter().collect();
        let stacked = BTreeMap::stack(&refs).unwrap();

        assert_eq!(stacked["a"].size(), [2, 2]);
        assert_eq!(stacked["b"].size(), [2]);
        let b = Vec::<f32>::try_from(&stacked["b"]).unwrap();
        assert_eq!(b, vec![2.0, 100.0]);
    }

    #[test]
    fn test_stack_missing_key() {
        let full = tree(0.0);
        let mut partial = tree(0.0);
        partial.remove("b");
        let err = BTreeMap::stack(&[&full, &partial]).unwrap_err();
        assert!(matches!(err, PhasicError::MissingField(k) if k == "b"));
    }

    #[test]
    fn test_stack_empty() {
        let err = <Tensor as TensorTree>::stack(&[]).unwrap_err();
        assert!(matches!(err, PhasicError::EmptyStack));
    }

    #[test]
    fn test_minibatched_call_matches_direct() {
        let input = Tensor::arange(10, (Kind::Float, Device::Cpu)).reshape([10, 1]);
        let mut calls = 0;
        let out: Tensor = minibatched_call(&input, 3, |chunk: &Tensor| {
            calls += 1;
            assert!(chunk.size()[0] <= 3);
            Ok(chunk * 2.0)
        })
        .unwrap();

        assert_eq!(calls, 4);
        assert!(out.allclose(&(&input * 2.0), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_minibatched_call_rejects_zero_chunk() {
        let input = Tensor::zeros([4], (Kind::Float, Device::Cpu));
        let res: Result<Tensor> = minibatched_call(&input, 0, |t: &Tensor| Ok(t.shallow_clone()));
        assert!(matches!(res, Err(PhasicError::InvalidConfig(_))));
    }
}
