//! Main phase followed by the auxiliary distillation phase.

use super::config::SgdConfig;
use super::minibatch::{minibatches, smallest_minibatch};
use super::segments::{make_minibatches, Segment, SegmentPool};
use super::stats::{averaged, standardized, StatLists, StatValue, Stats};
use crate::batch::{Batch, MultiAgentBatch, PolicyId, SampleBatch, OBS};
use crate::learner::{Learner, PolicyMap};
use crate::policy::{AuxModel, AuxPolicy};
use crate::tree::{minibatched_call, TensorTree};
use crate::{PhasicError, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use tch::{Kind, Tensor};

/// Key under which the auxiliary-phase statistics are nested in a policy's fetches
pub const AUX_STATS_KEY: &str = "aux";

/// Averaged statistics per trained policy
pub type Fetches = BTreeMap<PolicyId, Stats>;

/// Runs the main and auxiliary phases for every policy in a batch.
///
/// Owns the shuffling RNG and the segment pool, so a single optimizer
/// processes one call at a time.
pub struct PhasicOptimizer {
    config: SgdConfig,
    rng: ChaCha8Rng,
    pool: SegmentPool,
}

impl PhasicOptimizer {
    pub fn new(config: SgdConfig) -> Result<Self> {
        config.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            rng,
            pool: SegmentPool::new(),
        })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    /// Segments retained by the last main phase and not yet consumed
    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Train every policy that has rows in `samples`.
    ///
    /// Per policy the main phase runs first, then the auxiliary phase over the
    /// segments it retained. The returned stats are the final main epoch's
    /// averages with the auxiliary averages nested under [`AUX_STATS_KEY`].
    /// Policies without rows are skipped; a learner error aborts the call.
    pub fn do_minibatch_sgd<P, L>(
        &mut self,
        samples: impl Into<Batch>,
        policies: &mut PolicyMap<P>,
        learner: &mut L,
    ) -> Result<Fetches>
    where
        P: AuxPolicy,
        L: Learner<P>,
    {
        let mut samples = samples.into().into_multi_agent();
        let policy_ids: Vec<PolicyId> = policies.keys().cloned().collect();

        let mut fetches = Fetches::new();
        for policy_id in policy_ids {
            let Some(batch) = samples.remove(&policy_id) else {
                continue;
            };

            self.check_segment_rows(batch.count())?;
            let mut stats = self.main_phase(&policy_id, batch, policies, learner)?;

            let policy = policies
                .get_mut(&policy_id)
                .ok_or_else(|| PhasicError::UnknownPolicy(policy_id.clone()))?;
            let aux_stats = self.aux_phase(policy)?;
            stats.insert(AUX_STATS_KEY.to_string(), StatValue::Nested(aux_stats));

            fetches.insert(policy_id, stats);
        }
        Ok(fetches)
    }

    /// Reject a batch whose main phase would retain segments shorter than
    /// `num_env_slots`, before any update is applied.
    fn check_segment_rows(&self, count: usize) -> Result<()> {
        let config = &self.config;
        if config.num_sgd_iter == 0 || config.aux_epochs == 0 || count == 0 {
            return Ok(());
        }
        let smallest = smallest_minibatch(count, config.sgd_minibatch_size);
        if smallest < config.num_env_slots {
            return Err(PhasicError::ShapeMismatch {
                expected: vec![config.num_env_slots],
                actual: vec![smallest],
            });
        }
        Ok(())
    }

    /// Run `num_sgd_iter` epochs of minibatch updates for one policy and retain
    /// a segment per minibatch. Returns the final epoch's averaged learner stats.
    pub fn main_phase<P, L>(
        &mut self,
        policy_id: &str,
        mut batch: SampleBatch,
        policies: &mut PolicyMap<P>,
        learner: &mut L,
    ) -> Result<Stats>
    where
        L: Learner<P>,
    {
        self.pool.clear();

        for field in &self.config.standardize_fields {
            let value = standardized(batch.field(field)?);
            batch.insert(field.clone(), value)?;
        }

        let mut samples = Batch::Single(batch);
        let mut stats = Stats::new();
        for epoch in 0..self.config.num_sgd_iter {
            let mut extra_fetches = StatLists::new();
            let epoch_batches =
                minibatches(&mut samples, self.config.sgd_minibatch_size, &mut self.rng)?;

            for minibatch in epoch_batches {
                let obs = minibatch.field(OBS)?.shallow_clone();
                let multi = MultiAgentBatch::single(policy_id, minibatch);

                let result = learner.learn_on_batch(policies, &multi);
                let mut batch_fetches = result.map_err(|e| PhasicError::LearnerFailure {
                    policy_id: policy_id.to_string(),
                    source: Box::new(e),
                })?;
                let fetches = batch_fetches.remove(policy_id).ok_or_else(|| {
                    PhasicError::TrainingError(format!(
                        "learner returned no fetches for policy {}",
                        policy_id
                    ))
                })?;

                extra_fetches.extend_from(&fetches.learner_stats);
                let segment = Segment::new(obs, fetches.dones, fetches.oldpd, fetches.vtarg);
                self.pool.push(segment);
            }

            stats = averaged(&extra_fetches, None)?;
            tracing::debug!(policy_id, epoch, ?stats, "Main phase epoch");
        }
        Ok(stats)
    }

    /// Overwrite `oldpd` of every retained segment with the policy's current
    /// outputs, computed without gradients.
    pub fn refresh_distillation_targets<P: AuxPolicy>(&mut self, policy: &P) -> Result<()> {
        let device = self.config.device;
        let chunk = self.config.aux_forward_batch_size;
        let model = policy.model();

        for seg in self.pool.iter_mut() {
            seg.obs = seg.obs.f_to_device(device)?;
            let obs = &seg.obs;
            seg.oldpd = tch::no_grad(|| {
                minibatched_call(obs, chunk, |rows: &Tensor| {
                    model.forward(rows, None, None).map(|(logits, _)| logits)
                })
            })?;
        }
        Ok(())
    }

    /// Refresh distillation targets, then run `aux_epochs` epochs over
    /// cross-segment minibatches. The pool is empty afterwards.
    pub fn aux_phase<P: AuxPolicy>(&mut self, policy: &mut P) -> Result<Stats> {
        self.refresh_distillation_targets(policy)?;

        let dist_kind = policy.dist_kind();
        let mut all_epochs = StatLists::new();
        for epoch in 0..self.config.aux_epochs {
            let mut epoch_stats = StatLists::new();
            let epoch_batches = make_minibatches(
                self.pool.as_slice(),
                self.config.aux_minibatch_size,
                self.config.num_env_slots,
                &mut self.rng,
            )?;

            for minibatch in epoch_batches {
                let mb = minibatch?.to_device(self.config.device)?;
                let out = policy.model().forward_aux(&mb)?;

                let target = dist_kind.distribution(&mb.oldpd)?;
                let current = dist_kind.distribution(&out.logits)?;
                let aux_kl = target.kl(&current)?.mean(Kind::Float);

                let vtarg = mb
                    .vtarg
                    .f_to_device(out.value.device())?
                    .f_to_kind(Kind::Float)?;
                let aux_vf_loss = (&out.aux_value - &vtarg).square().mean(Kind::Float) * 0.5;
                let true_vf_loss = (&out.value - &vtarg).square().mean(Kind::Float) * 0.5;
                let loss = &aux_kl + &aux_vf_loss + &true_vf_loss;

                epoch_stats.push("aux_kl", StatValue::from_tensor(&aux_kl)?);
                epoch_stats.push("aux_vf_loss", StatValue::from_tensor(&aux_vf_loss)?);
                epoch_stats.push("true_vf_loss", StatValue::from_tensor(&true_vf_loss)?);
                epoch_stats.push("aux_loss", StatValue::from_tensor(&loss)?);

                policy.aux_learn(&loss)?;
            }

            let stats = averaged(&epoch_stats, None)?;
            tracing::debug!(epoch, ?stats, "Aux phase epoch");
            all_epochs.extend_from(&stats);
        }

        let segments = self.pool.len();
        self.pool.clear();

        let stats = averaged(&all_epochs, None)?;
        tracing::info!(segments, epochs = self.config.aux_epochs, ?stats, "Aux phase done");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ADVANTAGES, DEFAULT_POLICY_ID, DONES, VALUE_TARGETS};
    use crate::learner::LearnerFetches;
    use crate::policy::{AuxOutput, DistKind};
    use tch::Device;

    /// Model whose outputs are a fixed function of the observations
    struct ScaleModel;

    impl AuxModel for ScaleModel {
        fn forward(
            &self,
            obs: &Tensor,
            _state: Option<&[Tensor]>,
            _seq_lens: Option<&Tensor>,
        ) -> Result<(Tensor, Option<Vec<Tensor>>)> {
            Ok((obs * 2.0, None))
        }

        fn forward_aux(&self, batch: &Segment) -> Result<AuxOutput> {
            let rows = batch.obs.size()[0];
            Ok(AuxOutput {
                logits: &batch.obs * 2.0,
                aux_value: Tensor::zeros([rows], (Kind::Float, Device::Cpu)),
                value: Tensor::zeros([rows], (Kind::Float, Device::Cpu)),
            })
        }
    }

    struct StubPolicy {
        model: ScaleModel,
        aux_steps: usize,
    }

    impl AuxPolicy for StubPolicy {
        type Model = ScaleModel;

        fn model(&self) -> &ScaleModel {
            &self.model
        }

        fn dist_kind(&self) -> DistKind {
            DistKind::Categorical
        }

        fn aux_learn(&mut self, _loss: &Tensor) -> Result<()> {
            self.aux_steps += 1;
            Ok(())
        }
    }

    /// Echoes batch columns back and reports the minibatch size
    struct EchoLearner;

    impl Learner<StubPolicy> for EchoLearner {
        fn learn_on_batch(
            &mut self,
            _policies: &mut PolicyMap<StubPolicy>,
            batch: &MultiAgentBatch,
        ) -> Result<BTreeMap<PolicyId, LearnerFetches>> {
            let mut out = BTreeMap::new();
            for (id, samples) in batch.policy_batches() {
                let mut stats = Stats::new();
                stats.insert("rows".into(), StatValue::Scalar(samples.count() as f64));
                out.insert(
                    id.clone(),
                    LearnerFetches {
                        vtarg: samples.field(VALUE_TARGETS)?.shallow_clone(),
                        oldpd: Tensor::zeros(
                            [samples.count() as i64, 3],
                            (Kind::Float, Device::Cpu),
                        ),
                        dones: samples.field(DONES)?.shallow_clone(),
                        learner_stats: stats,
                    },
                );
            }
            Ok(out)
        }
    }

    /// Reports the 1-based index of each call as its only stat
    #[derive(Default)]
    struct CallCountLearner {
        calls: usize,
    }

    impl Learner<StubPolicy> for CallCountLearner {
        fn learn_on_batch(
            &mut self,
            policies: &mut PolicyMap<StubPolicy>,
            batch: &MultiAgentBatch,
        ) -> Result<BTreeMap<PolicyId, LearnerFetches>> {
            self.calls += 1;
            let mut out = EchoLearner.learn_on_batch(policies, batch)?;
            for fetches in out.values_mut() {
                fetches.learner_stats = Stats::from([("call".into(), (self.calls as f64).into())]);
            }
            Ok(out)
        }
    }

    fn rollout(rows: i64) -> SampleBatch {
        let opts = (Kind::Float, Device::Cpu);
        SampleBatch::from_fields([
            (OBS, Tensor::randn([rows, 3], opts)),
            (DONES, Tensor::zeros([rows], opts)),
            (VALUE_TARGETS, Tensor::ones([rows], opts)),
            (ADVANTAGES, Tensor::randn([rows], opts) * 5.0 + 3.0),
        ])
        .unwrap()
    }

    fn policies() -> PolicyMap<StubPolicy> {
        BTreeMap::from([(
            DEFAULT_POLICY_ID.to_string(),
            StubPolicy {
                model: ScaleModel,
                aux_steps: 0,
            },
        )])
    }

    #[test]
    fn test_main_phase_retains_one_segment_per_step() {
        let config = SgdConfig::default()
            .with_num_sgd_iter(2)
            .with_sgd_minibatch_size(32)
            .with_num_env_slots(4);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut policies = policies();

        let stats = opt
            .main_phase(DEFAULT_POLICY_ID, rollout(100), &mut policies, &mut EchoLearner)
            .unwrap();
        assert_eq!(opt.pool().len(), 8);
        // three slices of 32 and one of 4
        assert_eq!(stats["rows"].as_scalar(), Some(25.0));
    }

    #[test]
    fn test_main_phase_reports_final_epoch_only() {
        let config = SgdConfig::default()
            .with_num_sgd_iter(2)
            .with_sgd_minibatch_size(32);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut learner = CallCountLearner::default();

        let stats = opt
            .main_phase(DEFAULT_POLICY_ID, rollout(100), &mut policies(), &mut learner)
            .unwrap();

        // calls 1..=4 in the first epoch, 5..=8 in the second
        assert_eq!(learner.calls, 8);
        assert_eq!(stats["call"].as_scalar(), Some(6.5));
    }

    #[test]
    fn test_short_segments_rejected_before_any_update() {
        let config = SgdConfig::default()
            .with_sgd_minibatch_size(32)
            .with_num_env_slots(32);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut policies = policies();
        let mut learner = CallCountLearner::default();

        // 40 rows leave a final minibatch of 8
        let err = opt
            .do_minibatch_sgd(rollout(40), &mut policies, &mut learner)
            .unwrap_err();

        assert!(matches!(err, PhasicError::ShapeMismatch { .. }));
        assert_eq!(learner.calls, 0);
        assert!(opt.pool().is_empty());
    }

    #[test]
    fn test_short_segments_allowed_without_aux_epochs() {
        let config = SgdConfig::default()
            .with_sgd_minibatch_size(32)
            .with_num_env_slots(32)
            .with_aux_epochs(0);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut learner = CallCountLearner::default();

        let fetches = opt
            .do_minibatch_sgd(rollout(40), &mut policies(), &mut learner)
            .unwrap();
        assert_eq!(learner.calls, 2);
        assert!(fetches.contains_key(DEFAULT_POLICY_ID));
    }

    #[test]
    fn test_missing_standardize_field() {
        let config = SgdConfig::default().with_standardize_fields(["not_there"]);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let err = opt
            .main_phase(DEFAULT_POLICY_ID, rollout(8), &mut policies(), &mut EchoLearner)
            .unwrap_err();
        assert!(matches!(err, PhasicError::MissingField(_)));
    }

    #[test]
    fn test_refresh_overwrites_oldpd() {
        let config = SgdConfig::default()
            .with_sgd_minibatch_size(8)
            .with_aux_forward_batch_size(3)
            .with_num_env_slots(8);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut policies = policies();
        opt.main_phase(DEFAULT_POLICY_ID, rollout(16), &mut policies, &mut EchoLearner)
            .unwrap();

        opt.refresh_distillation_targets(&policies[DEFAULT_POLICY_ID])
            .unwrap();
        for seg in opt.pool().iter() {
            assert_eq!(seg.oldpd.size(), [8, 3]);
            let expected = &seg.obs * 2.0;
            assert!(seg.oldpd.allclose(&expected, 1e-6, 1e-6, false));
            assert!(!seg.oldpd.requires_grad());
        }
    }

    #[test]
    fn test_aux_phase_steps_and_clears_pool() {
        let config = SgdConfig::default()
            .with_sgd_minibatch_size(8)
            .with_num_env_slots(8)
            .with_aux_minibatch_size(16)
            .with_aux_epochs(3);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut policies = policies();

        let fetches = opt
            .do_minibatch_sgd(rollout(32), &mut policies, &mut EchoLearner)
            .unwrap();

        // 4 segments x 8 slots = 32 rows, two minibatches per aux epoch
        assert_eq!(policies[DEFAULT_POLICY_ID].aux_steps, 6);
        assert!(opt.pool().is_empty());

        let aux = fetches[DEFAULT_POLICY_ID][AUX_STATS_KEY].as_nested().unwrap();
        for key in ["aux_kl", "aux_vf_loss", "true_vf_loss", "aux_loss"] {
            assert!(aux.contains_key(key));
        }
        // refreshed targets equal the current logits
        assert!(aux["aux_kl"].as_scalar().unwrap().abs() < 1e-6);
        assert!((aux["aux_vf_loss"].as_scalar().unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_epochs() {
        let config = SgdConfig::default().with_num_sgd_iter(0);
        let mut opt = PhasicOptimizer::new(config).unwrap();
        let mut policies = policies();
        let fetches = opt
            .do_minibatch_sgd(rollout(8), &mut policies, &mut EchoLearner)
            .unwrap();
        let stats = &fetches[DEFAULT_POLICY_ID];
        assert_eq!(stats.len(), 1);
        assert!(stats[AUX_STATS_KEY].as_nested().unwrap().is_empty());
        assert_eq!(policies[DEFAULT_POLICY_ID].aux_steps, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SgdConfig::default().with_num_env_slots(0);
        assert!(PhasicOptimizer::new(config).is_err());
    }
}
