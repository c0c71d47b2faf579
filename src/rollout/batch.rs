//! Resumable batch pipeline: preprocess -> rollout -> judge -> stat.
//!
//! Every phase loads only the rollouts sitting in its prerequisite stage, so
//! calling a phase again on a half-finished batch processes just the
//! remainder, and calling it on a finished batch does nothing.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::stats::BatchStats;
use super::store::RolloutStore;
use super::types::{duplicate_for_group, BatchRef, Rollout, Stage};
use crate::config::Config;
use crate::data::{Problem, ProblemKey};
use crate::mistake::MistakeBank;
use crate::model::prompt;
use crate::runtime::{AgentRuntime, RunOutput, Verifier};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub grpo_n: usize,
    pub problems_per_batch: usize,
    pub rollout_concurrency: usize,
    pub judge_concurrency: usize,
    /// Budget for one agent-runtime attempt.
    pub task_timeout: Duration,
    pub max_retries: usize,
    pub success_threshold: f64,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            grpo_n: config.practice.grpo_n.max(1),
            problems_per_batch: config.problems_per_batch().max(1),
            rollout_concurrency: config.practice.rollout_concurrency.max(1),
            judge_concurrency: config.practice.judge_concurrency.max(1),
            task_timeout: config.task_timeout(),
            max_retries: config.practice.max_retries.max(1),
            success_threshold: config.practice.success_threshold,
        }
    }
}

pub struct RolloutBatchManager<A: AgentRuntime, V: Verifier> {
    store: RolloutStore,
    agent: A,
    verifier: V,
    settings: BatchSettings,
}

impl<A: AgentRuntime, V: Verifier> RolloutBatchManager<A, V> {
    pub fn new(store: RolloutStore, agent: A, verifier: V, settings: BatchSettings) -> Self {
        Self {
            store,
            agent,
            verifier,
            settings,
        }
    }

    pub fn store(&self) -> &RolloutStore {
        &self.store
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Create the epoch's rollouts: `problems` split into batches of
    /// `problems_per_batch`, each problem duplicated `grpo_n` times. All
    /// batches go into the store in one transaction.
    ///
    /// If the epoch already has rows (a resumed run) they are kept, and only
    /// batch indexes with no rows at all are filled in from `problems`.
    /// Returns the epoch's batch count.
    pub async fn prepare_epoch(
        &self,
        exp_id: &str,
        epoch: usize,
        first_step: usize,
        problems: &[Problem],
    ) -> Result<usize> {
        let plan = self.plan_epoch(exp_id, epoch, first_step, problems);
        let present = self.store.batch_indices(exp_id, epoch).await?;
        let batches = plan.len().max(present.last().map_or(0, |b| b + 1));

        let missing: Vec<Rollout> = plan
            .into_iter()
            .enumerate()
            .filter(|(b, _)| present.binary_search(b).is_err())
            .flat_map(|(_, rollouts)| rollouts)
            .collect();
        if !present.is_empty() && missing.is_empty() {
            info!(exp_id, epoch, batches, "Reusing existing epoch rollouts");
            return Ok(batches);
        }
        if !present.is_empty() {
            warn!(exp_id, epoch, present = present.len(), batches, "Completing partially prepared epoch");
        }

        let inserted = self.store.insert_rollouts(&missing).await?;
        info!(exp_id, epoch, problems = problems.len(), rollouts = inserted, batches, "Prepared epoch");
        Ok(batches)
    }

    /// The epoch's rollouts grouped by batch.
    fn plan_epoch(&self, exp_id: &str, epoch: usize, first_step: usize, problems: &[Problem]) -> Vec<Vec<Rollout>> {
        let grpo_n = self.settings.grpo_n;
        let mut occurrences: HashMap<ProblemKey, usize> = HashMap::new();
        problems
            .chunks(self.settings.problems_per_batch)
            .enumerate()
            .map(|(b, chunk)| {
                let batch = BatchRef {
                    exp_id: exp_id.to_string(),
                    epoch,
                    batch: b,
                    step: first_step + b,
                };
                let mut rollouts = duplicate_for_group(&batch, chunk, grpo_n);
                // A problem drawn twice in one epoch continues its dup indexes.
                for (problem, group) in chunk.iter().zip(rollouts.chunks_mut(grpo_n)) {
                    let seen = occurrences.entry(problem.key()).or_insert(0);
                    for r in group.iter_mut() {
                        r.dup_index += *seen * grpo_n;
                    }
                    *seen += 1;
                }
                rollouts
            })
            .collect()
    }

    /// Render prompts for `Init` rollouts and move them to `Prepared`.
    pub async fn preprocess(&self, batch: &BatchRef, experiences_text: &str) -> Result<usize> {
        let pending = self
            .store
            .load_batch_in_stage(&batch.exp_id, batch.epoch, batch.batch, Stage::Init)
            .await?;
        let mut prepared = 0;
        for rollout in &pending {
            let rendered = prompt::problem_with_experience(&rollout.question, experiences_text);
            match self.store.mark_prepared(rollout.id, &rendered).await {
                Ok(true) => prepared += 1,
                Ok(false) => debug!(rollout = rollout.id, "Rollout already past init"),
                Err(e) => warn!(rollout = rollout.id, error = %e, "Preprocess failed, left for retry"),
            }
        }
        debug!(%batch, prepared, "Preprocess finished");
        Ok(prepared)
    }

    /// Run the agent on every `Prepared` rollout.
    ///
    /// Each attempt is bounded by the task timeout; a rollout gets up to
    /// `max_retries` attempts back to back and stays `Prepared` if all fail.
    pub async fn rollout(&self, batch: &BatchRef) -> Result<usize> {
        let pending = self
            .store
            .load_batch_in_stage(&batch.exp_id, batch.epoch, batch.batch, Stage::Prepared)
            .await?;
        let total = pending.len();

        let done: Vec<bool> = stream::iter(pending)
            .map(|rollout| async move {
                let Some(output) = self.run_with_retries(&rollout).await else {
                    return false;
                };
                match self
                    .store
                    .mark_rolled_out(rollout.id, &output.transcript, &output.final_text)
                    .await
                {
                    Ok(advanced) => advanced,
                    Err(e) => {
                        warn!(rollout = rollout.id, error = %e, "Failed to record rollout");
                        false
                    }
                }
            })
            .buffer_unordered(self.settings.rollout_concurrency)
            .collect()
            .await;

        let completed = done.iter().filter(|d| **d).count();
        info!(%batch, completed, dropped = total - completed, "Rollout phase finished");
        Ok(completed)
    }

    async fn run_with_retries(&self, rollout: &Rollout) -> Option<RunOutput> {
        let prompt = rollout.prompt.as_deref().unwrap_or(&rollout.question);
        for attempt in 1..=self.settings.max_retries {
            match tokio::time::timeout(self.settings.task_timeout, self.agent.run(prompt)).await {
                Ok(Ok(output)) => return Some(output),
                Ok(Err(e)) => warn!(rollout = rollout.id, attempt, error = %e, "Agent run failed"),
                Err(_) => warn!(
                    rollout = rollout.id,
                    attempt,
                    timeout_secs = self.settings.task_timeout.as_secs(),
                    "Agent run timed out"
                ),
            }
        }
        warn!(rollout = rollout.id, attempts = self.settings.max_retries, "Rollout dropped from batch");
        None
    }

    /// Verify every `RolledOut` rollout. When `bank` is given, every judged
    /// rollout of the batch it has not absorbed yet is folded into it.
    pub async fn judge(&self, batch: &BatchRef, bank: Option<&mut MistakeBank>) -> Result<usize> {
        let pending = self
            .store
            .load_batch_in_stage(&batch.exp_id, batch.epoch, batch.batch, Stage::RolledOut)
            .await?;
        let total = pending.len();

        let judged: Vec<Option<Rollout>> = stream::iter(pending)
            .map(|mut rollout| async move {
                let verdict = match self.verifier.verify(&rollout).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(rollout = rollout.id, error = %e, "Verifier failed, left for retry");
                        return None;
                    }
                };
                match self
                    .store
                    .mark_judged(rollout.id, verdict.reward, verdict.reasoning.as_deref())
                    .await
                {
                    Ok(true) => {
                        rollout.reward = Some(verdict.reward);
                        rollout.critique = verdict.reasoning;
                        rollout.stage = Stage::Judged;
                        Some(rollout)
                    }
                    Ok(false) => None,
                    Err(e) => {
                        warn!(rollout = rollout.id, error = %e, "Failed to record verdict");
                        None
                    }
                }
            })
            .buffer_unordered(self.settings.judge_concurrency)
            .collect()
            .await;

        let mut judged: Vec<Rollout> = judged.into_iter().flatten().collect();
        judged.sort_by_key(|r| r.id);
        info!(%batch, judged = judged.len(), dropped = total - judged.len(), "Judge phase finished");

        // Judged rows the bank has not seen, including ones left over from an
        // interrupted earlier call.
        if let Some(bank) = bank {
            let unseen: Vec<Rollout> = self
                .judged(batch)
                .await?
                .into_iter()
                .filter(|r| !bank.has_absorbed(r.id))
                .collect();
            if !unseen.is_empty() {
                bank.update_from_judged(&unseen, Utc::now())?;
            }
        }
        Ok(judged.len())
    }

    /// Statistics over the batch's judged rollouts.
    pub async fn stat(&self, batch: &BatchRef) -> Result<BatchStats> {
        let rollouts = self.store.load_batch(&batch.exp_id, batch.epoch, batch.batch).await?;
        Ok(BatchStats::compute(&rollouts, self.settings.success_threshold))
    }

    /// All judged rollouts of the batch.
    pub async fn judged(&self, batch: &BatchRef) -> Result<Vec<Rollout>> {
        self.store
            .load_batch_in_stage(&batch.exp_id, batch.epoch, batch.batch, Stage::Judged)
            .await
    }

    /// Run all phases on one practice batch and return its statistics.
    pub async fn run_batch(
        &self,
        batch: &BatchRef,
        experiences_text: &str,
        bank: Option<&mut MistakeBank>,
    ) -> Result<BatchStats> {
        self.preprocess(batch, experiences_text).await?;
        self.rollout(batch).await?;
        self.judge(batch, bank).await?;
        let stats = self.stat(batch).await?;
        info!(%batch, %stats, "Batch finished");
        Ok(stats)
    }

    /// Evaluate `problems` with the given experience text under
    /// `<exp_id>/eval`, using `epoch = step`. The mistake bank is not touched.
    pub async fn evaluate(
        &self,
        exp_id: &str,
        step: usize,
        problems: &[Problem],
        grpo_n: usize,
        experiences_text: &str,
    ) -> Result<BatchStats> {
        let batch = BatchRef {
            exp_id: format!("{exp_id}/eval"),
            epoch: step,
            batch: 0,
            step,
        };
        let rollouts = duplicate_for_group(&batch, problems, grpo_n.max(1));
        self.store.insert_rollouts(&rollouts).await?;
        self.preprocess(&batch, experiences_text).await?;
        self.rollout(&batch).await?;
        self.judge(&batch, None).await?;
        let stats = self.stat(&batch).await?;
        info!(exp_id, step, %stats, "Evaluation finished");
        Ok(stats)
    }
}
