//! Retained segments and cross-segment minibatching for the auxiliary phase.

use crate::tree::TensorTree;
use crate::{PhasicError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use tch::Tensor;

/// The retained part of one main-phase minibatch
#[derive(Debug)]
pub struct Segment {
    /// Observations
    pub obs: Tensor,
    /// Done flags returned by the learner
    pub dones: Tensor,
    /// Distribution inputs; the distillation target once refreshed
    pub oldpd: Tensor,
    /// Value targets
    pub vtarg: Tensor,
}

impl Segment {
    /// Names of the retained fields
    pub const KEYS: [&'static str; 4] = ["obs", "dones", "oldpd", "vtarg"];

    pub fn new(obs: Tensor, dones: Tensor, oldpd: Tensor, vtarg: Tensor) -> Self {
        Self {
            obs,
            dones,
            oldpd,
            vtarg,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        match key {
            "obs" => Some(&self.obs),
            "dones" => Some(&self.dones),
            "oldpd" => Some(&self.oldpd),
            "vtarg" => Some(&self.vtarg),
            _ => None,
        }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            obs: self.obs.shallow_clone(),
            dones: self.dones.shallow_clone(),
            oldpd: self.oldpd.shallow_clone(),
            vtarg: self.vtarg.shallow_clone(),
        }
    }
}

impl TensorTree for Segment {
    fn map_tensors<F>(&self, f: &mut F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        Ok(Segment {
            obs: f(&self.obs)?,
            dones: f(&self.dones)?,
            oldpd: f(&self.oldpd)?,
            vtarg: f(&self.vtarg)?,
        })
    }

    fn stack(items: &[&Self]) -> Result<Self> {
        fieldwise(items, <Tensor as TensorTree>::stack)
    }

    fn cat(items: &[&Self]) -> Result<Self> {
        fieldwise(items, <Tensor as TensorTree>::cat)
    }

    fn batch_len(&self) -> Result<usize> {
        self.obs.batch_len()
    }
}

fn fieldwise<F>(items: &[&Segment], op: F) -> Result<Segment>
where
    F: Fn(&[&Tensor]) -> Result<Tensor>,
{
    let column = |get: fn(&Segment) -> &Tensor| {
        let tensors: Vec<&Tensor> = items.iter().map(|s| get(s)).collect();
        op(&tensors)
    };
    Ok(Segment {
        obs: column(|s| &s.obs)?,
        dones: column(|s| &s.dones)?,
        oldpd: column(|s| &s.oldpd)?,
        vtarg: column(|s| &s.vtarg)?,
    })
}

/// Segments collected during one policy's main phase
#[derive(Debug, Default)]
pub struct SegmentPool {
    segments: Vec<Segment>,
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Segment> {
        self.segments.iter_mut()
    }
}

/// One auxiliary epoch of minibatches mixing rows across segments.
///
/// Created by [`make_minibatches`].
#[derive(Debug)]
pub struct SegmentMinibatches<'a> {
    segs: &'a [Segment],
    /// Permuted `(env_slot, segment)` pairs
    pairs: Vec<(usize, usize)>,
    mbsize: usize,
    pos: usize,
}

impl Iterator for SegmentMinibatches<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Result<Segment>> {
        if self.pos >= self.pairs.len() {
            return None;
        }
        let end = (self.pos + self.mbsize).min(self.pairs.len());
        let chunk = &self.pairs[self.pos..end];
        self.pos = end;

        let gathered = chunk
            .iter()
            .map(|&(env, seg)| self.segs[seg].slice(env))
            .collect::<Result<Vec<_>>>();
        Some(gathered.and_then(|rows| {
            let refs: Vec<&Segment> = rows.iter().collect();
            Segment::stack(&refs)
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.pairs.len() - self.pos).div_ceil(self.mbsize);
        (n, Some(n))
    }
}

impl ExactSizeIterator for SegmentMinibatches<'_> {}

/// Yield one epoch of minibatches over `segs`, each mixing rows from different
/// segments and environment slots.
///
/// The index space is every `(env_slot, segment)` pair for
/// `env_slot < num_env_slots`; it is permuted once and cut into chunks of
/// `mbsize` pairs. Each segment must hold at least `num_env_slots` rows.
pub fn make_minibatches<'a, R: Rng + ?Sized>(
    segs: &'a [Segment],
    mbsize: usize,
    num_env_slots: usize,
    rng: &mut R,
) -> Result<SegmentMinibatches<'a>> {
    if mbsize == 0 {
        return Err(PhasicError::InvalidConfig(
            "aux minibatch size must be positive".to_string(),
        ));
    }
    for seg in segs {
        let len = seg.batch_len()?;
        if len < num_env_slots {
            return Err(PhasicError::ShapeMismatch {
                expected: vec![num_env_slots],
                actual: vec![len],
            });
        }
    }

    let nseg = segs.len();
    let mut pairs: Vec<(usize, usize)> = (0..num_env_slots)
        .flat_map(|env| (0..nseg).map(move |seg| (env, seg)))
        .collect();
    pairs.shuffle(rng);

    Ok(SegmentMinibatches {
        segs,
        pairs,
        mbsize,
        pos: 0,
    })
}
