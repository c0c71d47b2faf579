//! Batch statistics over judged rollouts.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::Rollout;
use crate::data::ProblemKey;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Average reward over every judged attempt.
    pub mean_at_k: f64,
    /// Fraction of problems with at least one attempt at or above the
    /// success threshold.
    pub pass_at_k: f64,
    /// Judged rollouts counted.
    pub rollouts: usize,
    /// Distinct problems among them.
    pub problems: usize,
    pub avg_tool_calls: f64,
    pub avg_turns: f64,
}

impl BatchStats {
    /// Aggregate the judged rollouts in `rollouts`; others are ignored.
    pub fn compute(rollouts: &[Rollout], success_threshold: f64) -> Self {
        let judged: Vec<&Rollout> = rollouts.iter().filter(|r| r.reward.is_some()).collect();
        if judged.is_empty() {
            return Self::default();
        }
        let n = judged.len() as f64;

        let mut solved: BTreeMap<ProblemKey, bool> = BTreeMap::new();
        for r in &judged {
            let hit = r.reward_or_zero() >= success_threshold;
            *solved.entry(r.problem_key()).or_default() |= hit;
        }

        Self {
            mean_at_k: judged.iter().map(|r| r.reward_or_zero()).sum::<f64>() / n,
            pass_at_k: solved.values().filter(|s| **s).count() as f64 / solved.len() as f64,
            rollouts: judged.len(),
            problems: solved.len(),
            avg_tool_calls: judged.iter().map(|r| r.tool_calls() as f64).sum::<f64>() / n,
            avg_turns: judged.iter().map(|r| r.transcript.len() as f64).sum::<f64>() / n,
        }
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mean@k={:.3} pass@k={:.3} rollouts={} problems={} tool_calls={:.2} turns={:.2}",
            self.mean_at_k, self.pass_at_k, self.rollouts, self.problems, self.avg_tool_calls, self.avg_turns
        )
    }
}
