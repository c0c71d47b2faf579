//! Training-free GRPO loop.
//!
//! ```text
//! for epoch in 0..epochs:
//!     sample the epoch (mistake-biased when the bank has failures)
//!     create rollouts, grpo_n duplicates per problem
//!     for batch in epoch:
//!         preprocess -> rollout -> judge (mistake bank) -> stat
//!         experiences = cache[step] or update(judged, experiences)
//!         hierarchy.process_step(old, new)          (when enabled)
//!         evaluate every `eval_every_steps` steps     (when configured)
//! write the agent configuration
//! ```
//!
//! The experience output of every step is cached in the rollout store, so a
//! restarted run replays cached steps instead of recomputing them. The
//! `restart_step` setting decides which steps may use the cache.

use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};

use super::artifact::materialize_agent_config;
use crate::config::Config;
use crate::data::Problem;
use crate::error::ConfigError;
use crate::experience::{ExperienceMap, ExperienceUpdater, HierarchicalExperienceManager, UpdaterSettings};
use crate::mistake::{sample_epoch, MistakeBank};
use crate::model::LlmClient;
use crate::rollout::{BatchRef, BatchSettings, BatchStats, RolloutBatchManager, RolloutStore};
use crate::runtime::{AgentRuntime, Verifier};

/// Result of one processed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub epoch: usize,
    pub batch: usize,
    pub step: usize,
    pub stats: BatchStats,
    pub experiences_len: usize,
    /// The experience update was taken from the step cache.
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalRecord {
    pub step: usize,
    pub stats: BatchStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub steps: Vec<StepRecord>,
    pub evals: Vec<EvalRecord>,
    pub experiences: ExperienceMap,
    pub experiences_text: String,
}

/// Whether `step` may reuse a cached experience update.
pub fn use_cache_for(restart_step: Option<usize>, step: usize) -> bool {
    match restart_step {
        None => true,
        Some(n) => step < n,
    }
}

pub struct TrainingFreeGrpo<L, A, V>
where
    L: LlmClient + Clone,
    A: AgentRuntime,
    V: Verifier,
{
    config: Config,
    batches: RolloutBatchManager<A, V>,
    updater: ExperienceUpdater<L>,
    hierarchy: Option<HierarchicalExperienceManager<L>>,
    bank: Option<MistakeBank>,
    train: Vec<Problem>,
    eval: Vec<Problem>,
    experiences: ExperienceMap,
}

impl<L, A, V> TrainingFreeGrpo<L, A, V>
where
    L: LlmClient + Clone,
    A: AgentRuntime,
    V: Verifier,
{
    /// Wire the engine together. Fails fast on invalid settings or an empty
    /// training set.
    pub fn new(
        config: Config,
        store: RolloutStore,
        client: L,
        agent: A,
        verifier: V,
        train: Vec<Problem>,
        eval: Vec<Problem>,
    ) -> Result<Self> {
        config.validate_settings()?;
        if train.is_empty() {
            return Err(ConfigError::EmptyDataset(config.data.train_name.clone()).into());
        }

        let policy = config.retry_policy();
        let params = config.query_params();
        let hierarchy = if config.hierarchical.enabled {
            Some(HierarchicalExperienceManager::open(
                client.clone(),
                policy.clone(),
                params.clone(),
                config.hierarchical.clone(),
                config.hierarchy_path(),
            )?)
        } else {
            None
        };
        let bank = if config.mistake_bank.enabled {
            Some(MistakeBank::open(
                config.exp_id.clone(),
                config.mistake_bank_path(),
                config.mistake_bank.clone(),
                config.practice.success_threshold,
            )?)
        } else {
            None
        };
        let updater = ExperienceUpdater::new(client, policy, params, UpdaterSettings::from_config(&config));
        let batches = RolloutBatchManager::new(store, agent, verifier, BatchSettings::from_config(&config));

        Ok(Self {
            config,
            batches,
            updater,
            hierarchy,
            bank,
            train,
            eval,
            experiences: ExperienceMap::new(),
        })
    }

    pub fn experiences(&self) -> &ExperienceMap {
        &self.experiences
    }

    pub fn mistake_bank(&self) -> Option<&MistakeBank> {
        self.bank.as_ref()
    }

    pub fn hierarchy(&self) -> Option<&HierarchicalExperienceManager<L>> {
        self.hierarchy.as_ref()
    }

    pub fn batches(&self) -> &RolloutBatchManager<A, V> {
        &self.batches
    }

    /// Agent-facing experience text for the current state.
    pub fn experiences_text(&self) -> String {
        match &self.hierarchy {
            Some(h) => h.assemble_text(),
            None => self.experiences.format_enumerated(),
        }
    }

    fn eval_enabled(&self) -> bool {
        !self.eval.is_empty() && self.config.practice.eval_every_steps > 0
    }

    /// Run every epoch, then write the agent configuration.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let exp_id = self.config.exp_id.clone();
        info!(
            exp_id = %exp_id,
            epochs = self.config.practice.epochs,
            train = self.train.len(),
            eval = self.eval.len(),
            grpo_n = self.config.practice.grpo_n,
            batch_size = self.config.practice.batch_size,
            hierarchical = self.hierarchy.is_some(),
            mistake_bank = self.bank.is_some(),
            "Starting training-free GRPO"
        );

        let mut summary = RunSummary::default();
        let mut step = 0;
        if self.eval_enabled() {
            summary.evals.push(self.evaluate(step).await?);
        }

        for epoch in 0..self.config.practice.epochs {
            let problems = self.epoch_problems(epoch);
            let n_batches = self.batches.prepare_epoch(&exp_id, epoch, step, &problems).await?;
            for b in 0..n_batches {
                let batch = BatchRef {
                    exp_id: exp_id.clone(),
                    epoch,
                    batch: b,
                    step,
                };
                let record = self.run_step(&batch).await?;
                summary.steps.push(record);
                step += 1;
                if self.eval_enabled() && step % self.config.practice.eval_every_steps == 0 {
                    summary.evals.push(self.evaluate(step).await?);
                }
            }
            info!(epoch, steps = step, experiences = self.experiences.len(), "Epoch finished");
        }

        let text = self.experiences_text();
        materialize_agent_config(
            self.config.storage.agent_template.as_deref(),
            &text,
            &self.config.output_path(),
        )?;
        summary.experiences = self.experiences.clone();
        summary.experiences_text = text;
        Ok(summary)
    }

    /// The epoch's problems, composed with a seed derived from the epoch.
    pub fn epoch_problems(&self, epoch: usize) -> Vec<Problem> {
        let data = &self.config.data;
        let n = data.epoch_size.unwrap_or(self.train.len());
        let mut rng = StdRng::seed_from_u64(self.config.practice.seed.wrapping_add(epoch as u64));
        let bank = self.bank.as_ref().filter(|b| b.has_failures());
        if bank.is_none() && !data.shuffle {
            return self.train.iter().cycle().take(n).cloned().collect();
        }
        sample_epoch(
            &self.train,
            bank,
            n,
            self.config.mistake_bank.focus_ratio,
            &mut rng,
            Utc::now(),
        )
    }

    /// Process one batch: run its rollouts, then update the experiences
    /// (or restore them from the step cache).
    pub async fn run_step(&mut self, batch: &BatchRef) -> Result<StepRecord> {
        let text = self.experiences_text();
        let stats = self.batches.run_batch(batch, &text, self.bank.as_mut()).await?;

        let store = self.batches.store();
        let cached = if use_cache_for(self.config.practice.restart_step, batch.step) {
            store.load_experiences(&batch.exp_id, batch.step).await?
        } else {
            None
        };

        let hit = cached.is_some();
        match cached {
            Some(c) => {
                info!(step = batch.step, experiences = c.experiences.len(), "Using cached experiences");
                self.experiences = c.experiences;
            }
            None => {
                let judged = self.batches.judged(batch).await?;
                let report = self.updater.update(&judged, &self.experiences).await?;
                if !report.reconciled {
                    warn!(step = batch.step, "Experience update made no progress this step");
                }
                if let Some(h) = self.hierarchy.as_mut() {
                    h.process_step(batch.step, &self.experiences, &report.experiences).await?;
                }
                self.batches
                    .store()
                    .save_experiences(&batch.exp_id, batch.step, batch.epoch, batch.batch, &report.experiences)
                    .await?;
                self.experiences = report.experiences;
            }
        }

        info!(
            epoch = batch.epoch,
            batch = batch.batch,
            step = batch.step,
            cached = hit,
            experiences = self.experiences.len(),
            %stats,
            "Step finished"
        );
        Ok(StepRecord {
            epoch: batch.epoch,
            batch: batch.batch,
            step: batch.step,
            stats,
            experiences_len: self.experiences.len(),
            cached: hit,
        })
    }

    async fn evaluate(&self, step: usize) -> Result<EvalRecord> {
        let stats = self
            .batches
            .evaluate(
                &self.config.exp_id,
                step,
                &self.eval,
                self.config.practice.eval_grpo_n,
                &self.experiences_text(),
            )
            .await?;
        Ok(EvalRecord { step, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mistake::MistakeStatus;
    use crate::test_support::{problems, FixedAgent, RewardTableVerifier, ScriptedLlm};

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.exp_id = "e2e".into();
        config.storage.workdir = dir.to_path_buf();
        config.practice.epochs = 1;
        config.practice.grpo_n = 4;
        config.practice.batch_size = 8;
        config.practice.max_retries = 1;
        config.data.shuffle = false;
        config.experience.llm_max_attempts = 1;
        config
    }

    fn engine(
        config: Config,
        store: RolloutStore,
        llm: ScriptedLlm,
    ) -> TrainingFreeGrpo<ScriptedLlm, FixedAgent, RewardTableVerifier> {
        let verifier = RewardTableVerifier::new(&[(0, 1.0), (1, 0.0)]);
        TrainingFreeGrpo::new(
            config,
            store,
            llm,
            FixedAgent::answering("\\boxed{1}"),
            verifier,
            problems(2),
            problems(2),
        )
        .unwrap()
    }

    #[test]
    fn test_use_cache_for() {
        assert!(use_cache_for(None, 0));
        assert!(use_cache_for(None, 9));
        assert!(!use_cache_for(Some(0), 0));
        assert!(use_cache_for(Some(3), 2));
        assert!(!use_cache_for(Some(3), 3));
    }

    #[tokio::test]
    async fn test_end_to_end_success_and_failure_groups() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlm::default();
        let mut engine = engine(config(dir.path()), RolloutStore::open_in_memory().unwrap(), llm);
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.steps.len(), 1);
        let step = &summary.steps[0];
        assert_eq!(step.stats.rollouts, 8);
        assert!((step.stats.pass_at_k - 0.5).abs() < 1e-9);
        assert!(!step.cached);
        assert!(!summary.experiences.is_empty());

        // One advantage call per problem, each yielding a candidate.
        assert_eq!(engine.updater.client().calls_with("<Experiences>"), 2);

        let bank = engine.mistake_bank().unwrap();
        let pool = problems(2);
        let solved = bank.get(&pool[0].key()).unwrap();
        assert_eq!(solved.status, MistakeStatus::Solved);
        assert!(solved.success_experience.is_some());
        assert!(solved.failure_experience.is_none());
        let failed = bank.get(&pool[1].key()).unwrap();
        assert_eq!(failed.status, MistakeStatus::Failed);
        assert!(failed.failure_experience.is_some());

        let agent_yaml = std::fs::read_to_string(dir.path().join("e2e_agent.yaml")).unwrap();
        assert!(agent_yaml.contains("[G0]."));
    }

    #[tokio::test]
    async fn test_restart_step_controls_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = RolloutStore::open(dir.path().join("rollouts.sqlite")).await.unwrap();

        let mut first = engine(config(dir.path()), store.clone(), ScriptedLlm::default());
        first.run().await.unwrap();

        // Default: the cached step is replayed without any LLM call.
        let replay_llm = ScriptedLlm::default();
        let mut replay = engine(config(dir.path()), store.clone(), replay_llm);
        let summary = replay.run().await.unwrap();
        assert!(summary.steps[0].cached);
        assert_eq!(replay.updater.client().total_calls(), 0);
        assert_eq!(&summary.experiences, first.experiences());

        // restart_step = 0 recomputes everything.
        let mut cfg = config(dir.path());
        cfg.practice.restart_step = Some(0);
        let mut fresh = engine(cfg, store, ScriptedLlm::default());
        let summary = fresh.run().await.unwrap();
        assert!(!summary.steps[0].cached);
        assert!(fresh.updater.client().total_calls() > 0);
    }

    #[tokio::test]
    async fn test_periodic_eval_and_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.practice.eval_every_steps = 1;
        cfg.practice.eval_grpo_n = 2;
        cfg.practice.epochs = 2;
        cfg.hierarchical.enabled = true;
        cfg.hierarchical.l1_aggregation_threshold = 2;
        let mut engine = engine(cfg, RolloutStore::open_in_memory().unwrap(), ScriptedLlm::default());
        let summary = engine.run().await.unwrap();

        // Before the first step, then after each of the two steps.
        let eval_steps: Vec<_> = summary.evals.iter().map(|e| e.step).collect();
        assert_eq!(eval_steps, vec![0, 1, 2]);
        assert!(summary.evals.iter().all(|e| e.stats.rollouts == 4));

        let hierarchy = engine.hierarchy().unwrap();
        assert!(!hierarchy.state().l0.is_empty());
        assert!(summary.experiences_text.contains("[L0]"));
        assert!(dir.path().join("hierarchy").join("e2e.json").exists());
    }

    #[test]
    fn test_invalid_settings_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.practice.batch_size = 6;
        let result = TrainingFreeGrpo::new(
            cfg,
            RolloutStore::open_in_memory().unwrap(),
            ScriptedLlm::default(),
            FixedAgent::answering("x"),
            RewardTableVerifier::new(&[]),
            problems(2),
            Vec::new(),
        );
        assert!(result.is_err());

        let result = TrainingFreeGrpo::new(
            config(dir.path()),
            RolloutStore::open_in_memory().unwrap(),
            ScriptedLlm::default(),
            FixedAgent::answering("x"),
            RewardTableVerifier::new(&[]),
            Vec::new(),
            Vec::new(),
        );
        assert!(result.is_err());
    }
}
