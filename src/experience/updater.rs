//! Four-stage experience synthesis over one judged batch.
//!
//! ```text
//! judged rollouts
//!   -> 1. per-rollout summary      (<= 4 per problem, best and worst first)
//!   -> 2. group advantage          (<Experiences> block per problem)
//!   -> 3. group update             (JSON operations per problem)
//!   -> 4. batch update             (one reconciled revision plan)
//!   -> apply + renumber
//! ```
//!
//! Stages 1-3 drop the failing unit of work and carry on. Stage 4 retries the
//! whole reconciliation call and, if every attempt fails, returns the input
//! map untouched.

use std::collections::BTreeMap;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::map::{parse_operations, Applied, ExperienceMap, Operation};
use crate::config::Config;
use crate::data::ProblemKey;
use crate::error::LlmError;
use crate::model::prompt::{self, AttemptLabel, LabelledAttempt};
use crate::model::{LlmClient, QueryParams, RetryPolicy};
use crate::rollout::types::Rollout;

/// Representatives kept per problem in stages 1 and 2.
pub const MAX_REPRESENTATIVES: usize = 4;

#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub num_experiences_per_query: usize,
    pub concurrency: usize,
    pub batch_update_retries: usize,
    pub given_ground_truth: bool,
}

impl UpdaterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            num_experiences_per_query: config.experience.num_experiences_per_query.max(1),
            concurrency: config.experience.concurrency.max(1),
            batch_update_retries: config.experience.batch_update_retries.max(1),
            given_ground_truth: config.experience.given_ground_truth,
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            num_experiences_per_query: 1,
            concurrency: 16,
            batch_update_retries: 3,
            given_ground_truth: true,
        }
    }
}

/// Stage 1 output for one rollout.
#[derive(Debug, Clone)]
pub struct RolloutSummary {
    pub rollout_id: i64,
    pub key: ProblemKey,
    pub reward: f64,
    pub summary: String,
}

/// Everything one update cycle produced.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// The revised map, renumbered densely.
    pub experiences: ExperienceMap,
    pub summaries: usize,
    /// Stage 2 candidate lessons per problem.
    pub candidates: BTreeMap<ProblemKey, Vec<String>>,
    /// Stage 3 operations, before reconciliation.
    pub proposed_ops: usize,
    /// Operations from the revision plan that changed the map.
    pub applied_ops: usize,
    /// False when reconciliation failed and the map was left unchanged.
    pub reconciled: bool,
}

/// Pick at most [`MAX_REPRESENTATIVES`] items: the best, the worst (if it is
/// a different item), then the rest in input order.
pub fn select_representatives<T>(items: &[T], reward: impl Fn(&T) -> f64) -> Vec<&T> {
    if items.is_empty() {
        return Vec::new();
    }
    let mut best = 0;
    let mut worst = 0;
    for (i, item) in items.iter().enumerate() {
        if reward(item) > reward(&items[best]) {
            best = i;
        }
        if reward(item) < reward(&items[worst]) {
            worst = i;
        }
    }
    let mut order = vec![best];
    if worst != best {
        order.push(worst);
    }
    order.extend((0..items.len()).filter(|i| *i != best && *i != worst));
    order
        .into_iter()
        .take(MAX_REPRESENTATIVES)
        .map(|i| &items[i])
        .collect()
}

/// Label representatives chosen by [`select_representatives`].
///
/// Returns the labels and whether every reward was equal.
pub fn label_attempts(rewards: &[f64]) -> (Vec<AttemptLabel>, bool) {
    if rewards.len() == 1 {
        return (vec![AttemptLabel::Only], true);
    }
    let all_equal = rewards.windows(2).all(|w| (w[0] - w[1]).abs() < f64::EPSILON);
    let labels = rewards
        .iter()
        .enumerate()
        .map(|(i, _)| match (all_equal, i) {
            (true, _) => AttemptLabel::Other,
            (false, 0) => AttemptLabel::Best,
            (false, 1) => AttemptLabel::Worst,
            _ => AttemptLabel::Other,
        })
        .collect();
    (labels, all_equal)
}

pub struct ExperienceUpdater<L: LlmClient> {
    client: L,
    policy: RetryPolicy,
    params: QueryParams,
    settings: UpdaterSettings,
}

impl<L: LlmClient> ExperienceUpdater<L> {
    pub fn new(client: L, policy: RetryPolicy, params: QueryParams, settings: UpdaterSettings) -> Self {
        Self {
            client,
            policy,
            params,
            settings,
        }
    }

    pub fn client(&self) -> &L {
        &self.client
    }

    /// Run all four stages over the judged rollouts of one batch.
    pub async fn update(&self, rollouts: &[Rollout], current: &ExperienceMap) -> Result<UpdateReport> {
        let judged: Vec<&Rollout> = rollouts.iter().filter(|r| r.reward.is_some()).collect();
        if judged.is_empty() {
            info!("No judged rollouts, experiences unchanged");
            return Ok(UpdateReport {
                experiences: current.clone(),
                reconciled: true,
                ..Default::default()
            });
        }

        let groups = group_by_problem(&judged);
        let summaries = self.summarize(&groups).await;
        let candidates = self.group_advantage(&groups, &summaries).await;
        let ops = self.group_update(&candidates, current).await;
        let proposed_ops = ops.len();

        let (experiences, applied_ops, reconciled) = if ops.is_empty() {
            (current.clone(), 0, true)
        } else {
            match self.batch_update(&ops, current).await {
                Some(plan) => {
                    let mut revised = current.clone();
                    let applied = revised
                        .apply_all(&plan)
                        .into_iter()
                        .filter(|a| *a != Applied::Skipped)
                        .count();
                    (revised.renumbered(), applied, true)
                }
                None => (current.clone(), 0, false),
            }
        };

        info!(
            problems = groups.len(),
            summaries = summaries.len(),
            candidates = candidates.values().map(Vec::len).sum::<usize>(),
            proposed_ops,
            applied_ops,
            reconciled,
            experiences = experiences.len(),
            "Experience update finished"
        );

        Ok(UpdateReport {
            experiences,
            summaries: summaries.len(),
            candidates,
            proposed_ops,
            applied_ops,
            reconciled,
        })
    }

    async fn ask(&self, label: &str, system: &str, user: &str) -> Result<String, LlmError> {
        self.policy
            .run(label, || self.client.query(system, user, &self.params))
            .await
    }

    // ------------------------------------------------------------------
    // Stage 1
    // ------------------------------------------------------------------

    pub async fn summarize(&self, groups: &BTreeMap<ProblemKey, Vec<&Rollout>>) -> Vec<RolloutSummary> {
        let selected: Vec<&Rollout> = groups
            .values()
            .flat_map(|group| select_representatives(group, |r| r.reward_or_zero()))
            .copied()
            .collect();

        let results: Vec<Option<RolloutSummary>> = stream::iter(selected)
            .map(|rollout| async move {
                let ground_truth = if self.settings.given_ground_truth {
                    rollout.answer.as_deref()
                } else {
                    None
                };
                let (system, user) = prompt::rollout_summary(
                    &rollout.question,
                    &rollout.transcript,
                    rollout.final_text.as_deref().unwrap_or(""),
                    rollout.reward_or_zero(),
                    ground_truth,
                    rollout.critique.as_deref(),
                );
                match self.ask("rollout_summary", &system, &user).await {
                    Ok(text) if !text.trim().is_empty() => Some(RolloutSummary {
                        rollout_id: rollout.id,
                        key: rollout.problem_key(),
                        reward: rollout.reward_or_zero(),
                        summary: text.trim().to_string(),
                    }),
                    Ok(_) => {
                        warn!(rollout = rollout.id, "Empty rollout summary, dropped");
                        None
                    }
                    Err(e) => {
                        warn!(rollout = rollout.id, error = %e, "Rollout summary failed, dropped");
                        None
                    }
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        let summaries: Vec<RolloutSummary> = results.into_iter().flatten().collect();
        debug!(summaries = summaries.len(), "Stage 1 complete");
        summaries
    }

    // ------------------------------------------------------------------
    // Stage 2
    // ------------------------------------------------------------------

    pub async fn group_advantage(
        &self,
        groups: &BTreeMap<ProblemKey, Vec<&Rollout>>,
        summaries: &[RolloutSummary],
    ) -> BTreeMap<ProblemKey, Vec<String>> {
        let mut by_problem: BTreeMap<&ProblemKey, Vec<&RolloutSummary>> = BTreeMap::new();
        for s in summaries {
            by_problem.entry(&s.key).or_default().push(s);
        }
        // Stage 1 finishes in arbitrary order.
        for group in by_problem.values_mut() {
            group.sort_by_key(|s| s.rollout_id);
        }

        let n = self.settings.num_experiences_per_query;
        let results: Vec<Option<(ProblemKey, Vec<String>)>> = stream::iter(by_problem)
            .filter_map(|(key, group)| async move {
                let first = groups.get(key)?.first().copied()?;
                Some((key, group, first))
            })
            .map(|(key, group, first)| async move {
                let chosen = select_representatives(&group, |s| s.reward);
                let rewards: Vec<f64> = chosen.iter().map(|s| s.reward).collect();
                let (labels, all_equal) = label_attempts(&rewards);
                let attempts: Vec<LabelledAttempt<'_>> = chosen
                    .iter()
                    .zip(labels)
                    .map(|(s, label)| LabelledAttempt {
                        label,
                        reward: s.reward,
                        summary: &s.summary,
                    })
                    .collect();
                let ground_truth = if self.settings.given_ground_truth {
                    first.answer.as_deref()
                } else {
                    None
                };
                let (system, user) =
                    prompt::group_advantage(&first.question, ground_truth, &attempts, all_equal, n);
                let response = match self.ask("group_advantage", &system, &user).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(problem = %key, error = %e, "Group advantage failed, dropped");
                        return None;
                    }
                };
                match prompt::parse_experiences_block(&response) {
                    Some(mut lessons) if !lessons.is_empty() => {
                        lessons.truncate(n);
                        Some((key.clone(), lessons))
                    }
                    _ => {
                        warn!(problem = %key, "No <Experiences> block in group advantage, dropped");
                        None
                    }
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        results.into_iter().flatten().collect()
    }

    // ------------------------------------------------------------------
    // Stage 3
    // ------------------------------------------------------------------

    pub async fn group_update(
        &self,
        candidates: &BTreeMap<ProblemKey, Vec<String>>,
        current: &ExperienceMap,
    ) -> Vec<Operation> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let current_text = current.format_enumerated();
        let current_text = current_text.as_str();

        let results: Vec<(ProblemKey, Vec<Operation>)> = stream::iter(candidates)
            .map(|(key, lessons)| async move {
                let (system, user) = prompt::group_update(current_text, lessons);
                let response = match self.ask("group_update", &system, &user).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(problem = %key, error = %e, "Group update failed, dropped");
                        return (key.clone(), Vec::new());
                    }
                };
                match parse_operations(&response) {
                    Ok(ops) => (key.clone(), ops),
                    Err(e) => {
                        warn!(problem = %key, error = %e, "Malformed group update, dropped");
                        (key.clone(), Vec::new())
                    }
                }
            })
            .buffer_unordered(candidates.len())
            .collect()
            .await;

        // Deterministic order for the reconciliation prompt.
        let mut results = results;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results.into_iter().flat_map(|(_, ops)| ops).collect()
    }

    // ------------------------------------------------------------------
    // Stage 4
    // ------------------------------------------------------------------

    /// Ask for one reconciled revision plan. `None` when every attempt failed.
    pub async fn batch_update(&self, ops: &[Operation], current: &ExperienceMap) -> Option<Vec<Operation>> {
        let ops_json = match serde_json::to_string_pretty(ops) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize proposed operations");
                return None;
            }
        };
        let (system, user) = prompt::batch_update(&current.format_enumerated(), &ops_json);

        for attempt in 1..=self.settings.batch_update_retries {
            let response = match self.ask("batch_update", &system, &user).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(attempt, error = %e, "Batch update call failed");
                    continue;
                }
            };
            match parse_operations(&response) {
                Ok(plan) => {
                    debug!(attempt, ops = plan.len(), "Revision plan accepted");
                    return Some(plan);
                }
                Err(e) => warn!(attempt, error = %e, "Malformed revision plan"),
            }
        }
        warn!(
            attempts = self.settings.batch_update_retries,
            "Batch update exhausted, experiences unchanged"
        );
        None
    }
}

/// Group judged rollouts by problem, keeping input order within a group.
pub fn group_by_problem<'a>(rollouts: &[&'a Rollout]) -> BTreeMap<ProblemKey, Vec<&'a Rollout>> {
    let mut groups: BTreeMap<ProblemKey, Vec<&Rollout>> = BTreeMap::new();
    for r in rollouts {
        groups.entry(r.problem_key()).or_default().push(*r);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::map::ExperienceId;
    use crate::test_support::{judged_group, ScriptedLlm};

    fn updater(llm: ScriptedLlm) -> ExperienceUpdater<ScriptedLlm> {
        ExperienceUpdater::new(
            llm,
            RetryPolicy::none(),
            QueryParams::default(),
            UpdaterSettings::default(),
        )
    }

    #[test]
    fn test_select_representatives_best_and_worst_first() {
        let rewards = [0.5, 1.0, 0.2, 0.7, 0.9, 0.3];
        let chosen = select_representatives(&rewards, |r| *r);
        assert_eq!(chosen.len(), 4);
        assert_eq!(*chosen[0], 1.0);
        assert_eq!(*chosen[1], 0.2);

        let flat = [1.0, 1.0, 1.0];
        let chosen = select_representatives(&flat, |r| *r);
        assert_eq!(chosen.len(), 3);

        let one = [0.0];
        assert_eq!(select_representatives(&one, |r| *r).len(), 1);
        assert!(select_representatives::<f64>(&[], |r| *r).is_empty());
    }

    #[test]
    fn test_label_attempts() {
        let (labels, eq) = label_attempts(&[1.0, 0.0, 0.5]);
        assert!(!eq);
        assert_eq!(
            labels,
            vec![AttemptLabel::Best, AttemptLabel::Worst, AttemptLabel::Other]
        );
        let (labels, eq) = label_attempts(&[0.0, 0.0]);
        assert!(eq);
        assert_eq!(labels, vec![AttemptLabel::Other, AttemptLabel::Other]);
        let (labels, _) = label_attempts(&[1.0]);
        assert_eq!(labels, vec![AttemptLabel::Only]);
    }

    #[tokio::test]
    async fn test_update_produces_candidates_without_reward_spread() {
        let mut rollouts = judged_group(0, &[1.0, 1.0, 1.0, 1.0]);
        rollouts.extend(judged_group(1, &[0.0, 0.0, 0.0, 0.0]));
        let updater = updater(ScriptedLlm::default());
        let report = updater.update(&rollouts, &ExperienceMap::new()).await.unwrap();

        assert_eq!(report.candidates.len(), 2);
        assert!(report.candidates.values().all(|c| !c.is_empty()));
        // Four representatives per problem at most.
        assert_eq!(report.summaries, 8);
        assert!(report.reconciled);
        assert!(!report.experiences.is_empty());
        assert_eq!(report.experiences.iter().next().map(|(id, _)| id), Some(ExperienceId(0)));
    }

    #[tokio::test]
    async fn test_summary_cost_is_bounded_by_four_per_problem() {
        let rollouts = judged_group(0, &[0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]);
        let llm = ScriptedLlm::default();
        let updater = updater(llm);
        let report = updater.update(&rollouts, &ExperienceMap::new()).await.unwrap();
        assert_eq!(report.summaries, 4);
        assert_eq!(updater.client().calls_with("Summarize the attempt"), 4);
    }

    #[tokio::test]
    async fn test_failed_reconciliation_keeps_map() {
        let rollouts = judged_group(0, &[1.0, 0.0]);
        let llm = ScriptedLlm::default().with_batch_update_response("not json at all");
        let updater = updater(llm);
        let current: ExperienceMap = vec!["keep me".to_string()].into_iter().collect();
        let report = updater.update(&rollouts, &current).await.unwrap();
        assert!(!report.reconciled);
        assert_eq!(report.experiences, current);
        assert_eq!(
            updater.client().calls_with("Produce the final revision plan"),
            UpdaterSettings::default().batch_update_retries
        );
    }

    #[tokio::test]
    async fn test_permanent_errors_drop_units() {
        let rollouts = judged_group(0, &[1.0, 0.0]);
        let llm = ScriptedLlm::default().failing_summaries(LlmError::Permanent("bad request".into()));
        let updater = updater(llm);
        let current: ExperienceMap = vec!["x".to_string()].into_iter().collect();
        let report = updater.update(&rollouts, &current).await.unwrap();
        assert_eq!(report.summaries, 0);
        assert!(report.candidates.is_empty());
        assert_eq!(report.experiences, current);
    }

    #[tokio::test]
    async fn test_no_judged_rollouts_is_noop() {
        let mut rollouts = judged_group(0, &[1.0]);
        rollouts[0].reward = None;
        let updater = updater(ScriptedLlm::default());
        let report = updater.update(&rollouts, &ExperienceMap::new()).await.unwrap();
        assert!(report.experiences.is_empty());
        assert_eq!(updater.client().total_calls(), 0);
    }
}
