//! Persistent per-problem failure/success ledger.
//!
//! One [`MistakeRecord`] per problem key. Records are created on first
//! sighting, updated after every judged practice batch, and the whole bank is
//! rewritten to `<workdir>/mistake_bank/<exp_id>.json` after each update.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MistakeBankConfig;
use crate::data::ProblemKey;
use crate::experience::similarity::jaccard;
use crate::rollout::types::Rollout;

/// Upper bound on a synthesized one-line summary.
pub const MAX_SUMMARY_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MistakeStatus {
    Failed,
    Solved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistakeRecord {
    pub dataset: String,
    pub index: usize,
    /// Declared game or context of the problem, if any.
    #[serde(default)]
    pub context: Option<String>,
    pub status: MistakeStatus,
    pub attempts: u32,
    pub last_reward: f64,
    /// Active failure lesson. Replaced, never accumulated.
    #[serde(default)]
    pub failure_experience: Option<String>,
    #[serde(default)]
    pub success_experience: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl MistakeRecord {
    pub fn key(&self) -> ProblemKey {
        ProblemKey {
            dataset: self.dataset.clone(),
            index: self.index,
        }
    }
}

/// Sampling priority. Higher sorts earlier.
///
/// `base(status) + 1/(1 + hours since update) + 0.2 * min(attempts, 5)
/// + 1/(1 + max(last_reward, 0))`
pub fn score_for_sampling(record: &MistakeRecord, now: DateTime<Utc>) -> f64 {
    let base = match record.status {
        MistakeStatus::Failed => 3.0,
        MistakeStatus::Solved => 1.0,
    };
    let elapsed_hours = (now - record.last_updated).num_seconds().max(0) as f64 / 3600.0;
    let recency = 1.0 / (1.0 + elapsed_hours);
    let attempts = f64::from(record.attempts.min(5)) * 0.2;
    let inverse_reward = 1.0 / (1.0 + record.last_reward.max(0.0));
    base + recency + attempts + inverse_reward
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct BankFile {
    exp_id: String,
    updated_at: DateTime<Utc>,
    records: Vec<MistakeRecord>,
    /// Ids of the judged rollouts already folded into `records`.
    #[serde(default)]
    absorbed_rollouts: BTreeSet<i64>,
}

/// Outcome of one [`MistakeBank::update_from_judged`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MistakeUpdate {
    pub problems: usize,
    pub solved: usize,
    pub failed: usize,
    /// Failure texts taken over from another record in the same context.
    pub reused_failures: usize,
}

pub struct MistakeBank {
    exp_id: String,
    path: PathBuf,
    settings: MistakeBankConfig,
    success_threshold: f64,
    records: BTreeMap<ProblemKey, MistakeRecord>,
    absorbed: BTreeSet<i64>,
}

impl MistakeBank {
    /// Open the bank at `path`, loading it when the file exists.
    pub fn open(
        exp_id: impl Into<String>,
        path: impl Into<PathBuf>,
        settings: MistakeBankConfig,
        success_threshold: f64,
    ) -> Result<Self> {
        let exp_id = exp_id.into();
        let path = path.into();
        let (records, absorbed) = if path.exists() {
            load_file(&path)?
        } else {
            (BTreeMap::new(), BTreeSet::new())
        };
        if !records.is_empty() {
            info!(exp_id = %exp_id, records = records.len(), "Loaded mistake bank");
        }
        Ok(Self {
            exp_id,
            path,
            settings,
            success_threshold,
            records,
            absorbed,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &ProblemKey) -> Option<&MistakeRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &MistakeRecord> {
        self.records.values()
    }

    /// Whether the judged rollout `id` has already been folded in.
    pub fn has_absorbed(&self, id: i64) -> bool {
        self.absorbed.contains(&id)
    }

    pub fn has_failures(&self) -> bool {
        self.records.values().any(|r| r.status == MistakeStatus::Failed)
    }

    /// Records ordered by descending sampling score.
    pub fn ranked(&self, now: DateTime<Utc>) -> Vec<(&MistakeRecord, f64)> {
        let mut ranked: Vec<_> = self
            .records
            .values()
            .map(|r| (r, score_for_sampling(r, now)))
            .collect();
        ranked.sort_by_key(|(_, score)| Reverse(OrderedFloat(*score)));
        ranked
    }

    /// Fold a batch of judged rollouts into the ledger and persist it.
    ///
    /// Rollouts are grouped per problem: the problem counts as solved when any
    /// attempt reaches the success threshold, and `last_reward` is the best
    /// reward observed in the batch. Rollouts the bank has already absorbed
    /// are skipped, so feeding the same rows twice changes nothing.
    pub fn update_from_judged(&mut self, rollouts: &[Rollout], now: DateTime<Utc>) -> Result<MistakeUpdate> {
        let mut groups: BTreeMap<ProblemKey, Vec<&Rollout>> = BTreeMap::new();
        for r in rollouts
            .iter()
            .filter(|r| r.reward.is_some() && !self.absorbed.contains(&r.id))
        {
            groups.entry(r.problem_key()).or_default().push(r);
        }
        if groups.is_empty() {
            return Ok(MistakeUpdate::default());
        }

        let mut update = MistakeUpdate::default();
        for (key, group) in groups {
            update.problems += 1;
            self.absorbed.extend(group.iter().map(|r| r.id));
            let best = group
                .iter()
                .copied()
                .max_by(|a, b| a.reward_or_zero().total_cmp(&b.reward_or_zero()));
            let Some(best) = best else { continue };
            let worst = group
                .iter()
                .copied()
                .min_by(|a, b| a.reward_or_zero().total_cmp(&b.reward_or_zero()))
                .unwrap_or(best);
            let best_reward = best.reward_or_zero();
            let solved = best_reward >= self.success_threshold;

            // Computed before the entry borrow; it looks at other records.
            let failure_text = if solved {
                None
            } else {
                let fresh = failure_summary(worst);
                match self.reusable_failure(&key, worst.context.as_deref(), &fresh) {
                    Some(existing) => {
                        update.reused_failures += 1;
                        Some(existing)
                    }
                    None => Some(fresh),
                }
            };

            let record = self.records.entry(key.clone()).or_insert_with(|| MistakeRecord {
                dataset: key.dataset.clone(),
                index: key.index,
                context: best.context.clone(),
                status: MistakeStatus::Failed,
                attempts: 0,
                last_reward: 0.0,
                failure_experience: None,
                success_experience: None,
                first_seen: now,
                last_updated: now,
            });
            record.attempts = record.attempts.saturating_add(group.len() as u32);
            record.last_reward = best_reward;
            record.last_updated = now;

            match failure_text {
                None => {
                    record.status = MistakeStatus::Solved;
                    record.success_experience = Some(success_summary(best));
                    record.failure_experience = None;
                    update.solved += 1;
                }
                Some(text) => {
                    record.status = MistakeStatus::Failed;
                    let overwrite = match &record.failure_experience {
                        Some(current) => jaccard(current, &text) < self.settings.overwrite_similarity,
                        None => true,
                    };
                    if overwrite {
                        record.failure_experience = Some(text);
                    }
                    update.failed += 1;
                }
            }
        }

        self.save()?;
        debug!(
            problems = update.problems,
            solved = update.solved,
            failed = update.failed,
            reused = update.reused_failures,
            "Mistake bank updated"
        );
        Ok(update)
    }

    /// An existing failure text from another record in the same declared
    /// context that is a near-duplicate of `fresh`. Problems without a
    /// context never share.
    fn reusable_failure(&self, key: &ProblemKey, context: Option<&str>, fresh: &str) -> Option<String> {
        let context = context?;
        self.records
            .values()
            .filter(|r| r.key() != *key && r.context.as_deref() == Some(context))
            .filter_map(|r| r.failure_experience.as_deref())
            .find(|text| jaccard(text, fresh) >= self.settings.reuse_similarity)
            .map(str::to_string)
    }

    pub fn save(&self) -> Result<()> {
        let file = BankFile {
            exp_id: self.exp_id.clone(),
            updated_at: Utc::now(),
            records: self.records.values().cloned().collect(),
            absorbed_rollouts: self.absorbed.clone(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize mistake bank")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write mistake bank to {}", self.path.display()))?;
        Ok(())
    }
}

type Loaded = (BTreeMap<ProblemKey, MistakeRecord>, BTreeSet<i64>);

fn load_file(path: &Path) -> Result<Loaded> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mistake bank from {}", path.display()))?;
    let file: BankFile = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse mistake bank from {}", path.display()))?;
    let records = file.records.into_iter().map(|r| (r.key(), r)).collect();
    Ok((records, file.absorbed_rollouts))
}

fn one_line(text: &str) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match joined.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((idx, _)) => format!("{}...", &joined[..idx]),
        None => joined,
    }
}

fn context_prefix(rollout: &Rollout) -> String {
    rollout
        .context
        .as_deref()
        .map(|c| format!("[context={c}] "))
        .unwrap_or_default()
}

/// Deterministic one-line description of a failed attempt.
pub fn failure_summary(rollout: &Rollout) -> String {
    let detail = rollout
        .critique
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let answer = rollout
                .final_text
                .as_deref()
                .and_then(|t| t.lines().map(str::trim).filter(|l| !l.is_empty()).last())
                .unwrap_or("(no answer)");
            format!("answered '{answer}'")
        });
    one_line(&format!("{}Failed: {}", context_prefix(rollout), detail))
}

/// Deterministic one-line description of a successful attempt.
pub fn success_summary(rollout: &Rollout) -> String {
    let answer = rollout
        .final_text
        .as_deref()
        .and_then(|t| t.lines().map(str::trim).filter(|l| !l.is_empty()).last())
        .unwrap_or("");
    one_line(&format!(
        "{}Solved (reward {:.2}) in {} turn(s): {}",
        context_prefix(rollout),
        rollout.reward_or_zero(),
        rollout.transcript.len(),
        answer
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::test_support::judged_group;

    fn record(status: MistakeStatus, attempts: u32, reward: f64, updated: DateTime<Utc>) -> MistakeRecord {
        MistakeRecord {
            dataset: "d".into(),
            index: 0,
            context: None,
            status,
            attempts,
            last_reward: reward,
            failure_experience: None,
            success_experience: None,
            first_seen: updated,
            last_updated: updated,
        }
    }

    fn open_bank(dir: &Path) -> MistakeBank {
        MistakeBank::open("exp", dir.join("mistake_bank").join("exp.json"), MistakeBankConfig::default(), 0.5)
            .unwrap()
    }

    #[test]
    fn test_score_decreases_with_elapsed_time() {
        let t0 = Utc::now();
        let r = record(MistakeStatus::Failed, 2, 0.0, t0);
        let mut last = f64::INFINITY;
        for hours in [0, 1, 5, 24, 24 * 30] {
            let s = score_for_sampling(&r, t0 + Duration::hours(hours));
            assert!(s <= last);
            last = s;
        }
    }

    #[test]
    fn test_failed_scores_above_solved() {
        let t0 = Utc::now();
        let failed = record(MistakeStatus::Failed, 3, 0.2, t0);
        let solved = record(MistakeStatus::Solved, 3, 0.2, t0);
        assert!(score_for_sampling(&failed, t0) > score_for_sampling(&solved, t0));
    }

    #[test]
    fn test_update_marks_failed_and_solved() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = open_bank(dir.path());
        let mut rollouts = judged_group(0, &[1.0, 1.0, 1.0, 1.0]);
        rollouts.extend(judged_group(1, &[0.0, 0.0, 0.0, 0.0]));
        let update = bank.update_from_judged(&rollouts, Utc::now()).unwrap();
        assert_eq!(update.solved, 1);
        assert_eq!(update.failed, 1);

        let solved = bank.get(&rollouts[0].problem_key()).unwrap();
        assert_eq!(solved.status, MistakeStatus::Solved);
        assert!(solved.success_experience.is_some());
        assert!(solved.failure_experience.is_none());
        assert_eq!(solved.attempts, 4);

        let failed = bank.get(&rollouts[4].problem_key()).unwrap();
        assert_eq!(failed.status, MistakeStatus::Failed);
        assert!(failed.failure_experience.is_some());
    }

    #[test]
    fn test_solving_clears_failure_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = open_bank(dir.path());
        bank.update_from_judged(&judged_group(0, &[0.0]), Utc::now()).unwrap();
        bank.update_from_judged(&judged_group(0, &[0.0, 1.0]), Utc::now()).unwrap();

        let reloaded = open_bank(dir.path());
        let rec = reloaded.records().next().unwrap();
        assert_eq!(rec.status, MistakeStatus::Solved);
        assert_eq!(rec.attempts, 3);
        assert!(rec.failure_experience.is_none());
        assert!(rec.success_experience.is_some());
    }

    #[test]
    fn test_near_duplicate_failure_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = open_bank(dir.path());
        let mut first = judged_group(0, &[0.0]);
        first[0].critique = Some("forgot to carry the one in column three".into());
        bank.update_from_judged(&first, Utc::now()).unwrap();

        let mut second = judged_group(0, &[0.0]);
        second[0].critique = Some("Forgot to carry the one in column three!".into());
        second[0].reward = Some(0.1);
        bank.update_from_judged(&second, Utc::now()).unwrap();
        let text = bank.get(&first[0].problem_key()).unwrap().failure_experience.clone().unwrap();
        assert!(text.contains("forgot to carry"));

        let mut third = judged_group(0, &[0.0]);
        third[0].critique = Some("misread the grid size entirely".into());
        bank.update_from_judged(&third, Utc::now()).unwrap();
        let text = bank.get(&first[0].problem_key()).unwrap().failure_experience.clone().unwrap();
        assert!(text.contains("misread"));
    }

    #[test]
    fn test_failure_text_reused_within_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = open_bank(dir.path());
        let mut a = judged_group(0, &[0.0]);
        a[0].context = Some("sudoku".into());
        a[0].critique = Some("left a duplicate digit in row one".into());
        bank.update_from_judged(&a, Utc::now()).unwrap();

        let mut b = judged_group(1, &[0.0]);
        b[0].context = Some("sudoku".into());
        b[0].critique = Some("left a duplicate digit in row one".into());
        let update = bank.update_from_judged(&b, Utc::now()).unwrap();
        assert_eq!(update.reused_failures, 1);
        assert_eq!(
            bank.get(&a[0].problem_key()).unwrap().failure_experience,
            bank.get(&b[0].problem_key()).unwrap().failure_experience
        );

        let mut c = judged_group(2, &[0.0]);
        c[0].context = Some("kakuro".into());
        c[0].critique = Some("left a duplicate digit in row one".into());
        assert_eq!(bank.update_from_judged(&c, Utc::now()).unwrap().reused_failures, 0);
    }

    #[test]
    fn test_same_rollouts_are_absorbed_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = open_bank(dir.path());
        let rollouts = judged_group(0, &[0.0, 0.0]);
        assert_eq!(bank.update_from_judged(&rollouts, Utc::now()).unwrap().problems, 1);
        assert!(bank.has_absorbed(rollouts[0].id));

        let mut reloaded = open_bank(dir.path());
        assert_eq!(reloaded.update_from_judged(&rollouts, Utc::now()).unwrap(), MistakeUpdate::default());
        assert_eq!(reloaded.get(&rollouts[0].problem_key()).unwrap().attempts, 2);
    }

    #[test]
    fn test_failure_text_not_shared_without_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = open_bank(dir.path());
        let mut a = judged_group(0, &[0.0]);
        a[0].critique = Some("left a duplicate digit in row one".into());
        bank.update_from_judged(&a, Utc::now()).unwrap();

        let mut b = judged_group(1, &[0.0]);
        b[0].critique = Some("left a duplicate digit in row one".into());
        assert_eq!(bank.update_from_judged(&b, Utc::now()).unwrap().reused_failures, 0);
    }
}
