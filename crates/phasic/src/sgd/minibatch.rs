//! Shuffled fixed-size minibatches over one policy's sample batch.

use crate::batch::{Batch, SampleBatch, STATE_IN_0};
use crate::log_once::log_once;
use crate::{PhasicError, Result};
use rand::seq::SliceRandom;
use rand::Rng;

const NOT_SHUFFLING_RNN_DATA: &str = "not_shuffling_rnn_data_in_simple_mode";

/// One epoch of minibatches over a single-policy batch.
///
/// Created by [`minibatches`]. Every row of the batch is yielded exactly once.
#[derive(Debug)]
pub struct Minibatches<'a> {
    samples: &'a SampleBatch,
    slices: std::vec::IntoIter<(usize, usize)>,
}

impl Iterator for Minibatches<'_> {
    type Item = SampleBatch;

    fn next(&mut self) -> Option<SampleBatch> {
        self.slices
            .next()
            .map(|(start, end)| self.samples.slice(start, end))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.slices.size_hint()
    }
}

impl ExactSizeIterator for Minibatches<'_> {}

/// Split `samples` into minibatches of `sgd_minibatch_size` rows.
///
/// A size of zero yields the whole batch once. Otherwise the rows are shuffled
/// in place (skipped for recurrent data, which must keep its order), cut into
/// contiguous `[i, i + size)` slices with a possibly shorter last slice, and
/// the slices are yielded in random order.
///
/// Multi-policy batches are rejected.
pub fn minibatches<'a, R: Rng + ?Sized>(
    samples: &'a mut Batch,
    sgd_minibatch_size: usize,
    rng: &mut R,
) -> Result<Minibatches<'a>> {
    let samples = match samples {
        Batch::Single(batch) => batch,
        Batch::Multi(_) => {
            return Err(PhasicError::UnsupportedInputKind(
                "Minibatching not implemented for multi-agent in simple mode".to_string(),
            ))
        }
    };

    if sgd_minibatch_size == 0 {
        return Ok(Minibatches {
            slices: vec![(0, samples.count())].into_iter(),
            samples,
        });
    }

    if samples.contains_key(STATE_IN_0) {
        if log_once(NOT_SHUFFLING_RNN_DATA) {
            tracing::warn!("Not shuffling RNN data for SGD in simple mode");
        }
    } else {
        samples.shuffle(rng)?;
    }

    let mut slices: Vec<(usize, usize)> = (0..samples.count())
        .step_by(sgd_minibatch_size)
        .map(|i| (i, i + sgd_minibatch_size))
        .collect();
    slices.shuffle(rng);

    Ok(Minibatches {
        samples,
        slices: slices.into_iter(),
    })
}

/// Rows in the smallest minibatch [`minibatches`] cuts from `count` rows.
pub fn smallest_minibatch(count: usize, sgd_minibatch_size: usize) -> usize {
    if sgd_minibatch_size == 0 || sgd_minibatch_size >= count {
        count
    } else if count % sgd_minibatch_size == 0 {
        sgd_minibatch_size
    } else {
        count % sgd_minibatch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{MultiAgentBatch, OBS};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tch::{Device, Kind, Tensor};

    fn indexed_batch(n: i64) -> Batch {
        let idx = Tensor::arange(n, (Kind::Int64, Device::Cpu));
        Batch::Single(SampleBatch::from_fields([(OBS, idx)]).unwrap())
    }

    fn rows(batch: &SampleBatch) -> Vec<i64> {
        Vec::<i64>::try_from(batch.field(OBS).unwrap()).unwrap()
    }

    #[test]
    fn test_partition_covers_every_row_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut batch = indexed_batch(100);
        let mbs: Vec<_> = minibatches(&mut batch, 32, &mut rng).unwrap().collect();

        assert_eq!(mbs.len(), 4);
        assert_eq!(mbs.iter().map(|b| b.count()).sum::<usize>(), 100);

        let mut seen: Vec<i64> = mbs.iter().flat_map(rows).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_size_yields_whole_batch() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut batch = indexed_batch(10);
        let mbs: Vec<_> = minibatches(&mut batch, 0, &mut rng).unwrap().collect();

        assert_eq!(mbs.len(), 1);
        assert_eq!(rows(&mbs[0]), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_multi_agent_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut batch = Batch::Multi(MultiAgentBatch::default());
        let err = minibatches(&mut batch, 8, &mut rng).unwrap_err();
        assert!(matches!(err, PhasicError::UnsupportedInputKind(_)));
    }

    #[test]
    fn test_recurrent_rows_keep_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let idx = Tensor::arange(12, (Kind::Int64, Device::Cpu));
        let state = Tensor::zeros([12, 4], (Kind::Float, Device::Cpu));
        let mut batch = Batch::Single(
            SampleBatch::from_fields([(OBS, idx), (STATE_IN_0, state)]).unwrap(),
        );

        for mb in minibatches(&mut batch, 4, &mut rng).unwrap() {
            let r = rows(&mb);
            // Each slice is a contiguous, ascending run of the original rows
            assert_eq!(r[0] % 4, 0);
            assert!(r.windows(2).all(|w| w[1] == w[0] + 1));
        }
    }

    #[test]
    fn test_rows_are_shuffled() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut batch = indexed_batch(100);
        let order: Vec<i64> = minibatches(&mut batch, 10, &mut rng)
            .unwrap()
            .flat_map(|mb| rows(&mb))
            .collect();

        assert_eq!(order.len(), 100);
        assert_ne!(order, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_slice_order_is_shuffled() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let idx = Tensor::arange(100, (Kind::Int64, Device::Cpu));
        let state = Tensor::zeros([100, 2], (Kind::Float, Device::Cpu));
        let mut batch = Batch::Single(
            SampleBatch::from_fields([(OBS, idx), (STATE_IN_0, state)]).unwrap(),
        );

        let starts: Vec<i64> = minibatches(&mut batch, 5, &mut rng)
            .unwrap()
            .map(|mb| rows(&mb)[0])
            .collect();
        let ascending: Vec<i64> = (0..100).step_by(5).collect();

        assert_eq!(starts.len(), 20);
        assert_ne!(starts, ascending);
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, ascending);
    }

    #[test]
    fn test_recurrent_warning_fires_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..2 {
            let idx = Tensor::arange(8, (Kind::Int64, Device::Cpu));
            let state = Tensor::zeros([8, 2], (Kind::Float, Device::Cpu));
            let mut batch = Batch::Single(
                SampleBatch::from_fields([(OBS, idx), (STATE_IN_0, state)]).unwrap(),
            );
            assert_eq!(minibatches(&mut batch, 4, &mut rng).unwrap().count(), 2);
        }
        assert!(!log_once(NOT_SHUFFLING_RNN_DATA));
    }

    #[test]
    fn test_smallest_minibatch() {
        assert_eq!(smallest_minibatch(256, 64), 64);
        assert_eq!(smallest_minibatch(100, 32), 4);
        assert_eq!(smallest_minibatch(100, 0), 100);
        assert_eq!(smallest_minibatch(50, 64), 50);
    }

    #[test]
    fn test_iterator_reports_length() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut batch = indexed_batch(33);
        let iter = minibatches(&mut batch, 8, &mut rng).unwrap();
        assert_eq!(iter.len(), 5);
    }
}
