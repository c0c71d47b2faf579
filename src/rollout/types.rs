//! Core rollout data types.
//!
//! A [`Rollout`] is one sampled attempt of the agent at one problem. Rollouts
//! are created in bulk at epoch start and advance in place through the
//! [`Stage`] machine; nothing is ever deleted.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Problem, ProblemKey};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Processing stage. Transitions are strictly forward:
///
/// ```text
/// Init -> Prepared -> RolledOut -> Judged
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    /// Prompt rendered, ready for the agent runtime.
    Prepared,
    RolledOut,
    Judged,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Prepared => "prepared",
            Stage::RolledOut => "rolled_out",
            Stage::Judged => "judged",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "init" => Stage::Init,
            "prepared" => Stage::Prepared,
            "rolled_out" => Stage::RolledOut,
            "judged" => Stage::Judged,
            other => bail!("unknown rollout stage '{other}'"),
        })
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// One turn of an agent transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// `"system"`, `"user"`, `"assistant"` or `"tool"`.
    pub role: String,
    pub content: String,
    /// Name of the tool invoked, for tool-call turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Turn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_name: Some(name.into()),
        }
    }

    pub fn is_tool_call(&self) -> bool {
        self.tool_name.is_some() || self.role == "tool"
    }
}

// ---------------------------------------------------------------------------
// Batch addressing
// ---------------------------------------------------------------------------

/// Addresses one batch of rollouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRef {
    pub exp_id: String,
    pub epoch: usize,
    pub batch: usize,
    /// Global step over all (epoch, batch) pairs.
    pub step: usize,
}

impl fmt::Display for BatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[epoch={} batch={} step={}]",
            self.exp_id, self.epoch, self.batch, self.step
        )
    }
}

// ---------------------------------------------------------------------------
// Rollout
// ---------------------------------------------------------------------------

/// One agent attempt at one problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    /// Row id assigned by the store (0 before insertion).
    pub id: i64,
    pub exp_id: String,
    pub epoch: usize,
    pub batch: usize,
    pub step: usize,
    pub dataset: String,
    pub problem_index: usize,
    /// Position within the problem's group (0..grpo_n).
    pub dup_index: usize,
    pub question: String,
    pub answer: Option<String>,
    pub context: Option<String>,
    /// Final prompt handed to the agent runtime (set by preprocess).
    pub prompt: Option<String>,
    pub transcript: Vec<Turn>,
    pub final_text: Option<String>,
    pub reward: Option<f64>,
    pub critique: Option<String>,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rollout {
    /// A fresh `Init`-stage rollout for `problem`.
    pub fn new(batch: &BatchRef, problem: &Problem, dup_index: usize) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            exp_id: batch.exp_id.clone(),
            epoch: batch.epoch,
            batch: batch.batch,
            step: batch.step,
            dataset: problem.dataset.clone(),
            problem_index: problem.index,
            dup_index,
            question: problem.question.clone(),
            answer: problem.answer.clone(),
            context: problem.context.clone(),
            prompt: None,
            transcript: Vec::new(),
            final_text: None,
            reward: None,
            critique: None,
            stage: Stage::Init,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn problem_key(&self) -> ProblemKey {
        ProblemKey {
            dataset: self.dataset.clone(),
            index: self.problem_index,
        }
    }

    pub fn tool_calls(&self) -> usize {
        self.transcript.iter().filter(|t| t.is_tool_call()).count()
    }

    /// Reward, treating an unjudged rollout as 0.
    pub fn reward_or_zero(&self) -> f64 {
        self.reward.unwrap_or(0.0)
    }
}

/// Expand problems into `grpo_n` contiguous duplicates each.
pub fn duplicate_for_group(batch: &BatchRef, problems: &[Problem], grpo_n: usize) -> Vec<Rollout> {
    problems
        .iter()
        .flat_map(|p| (0..grpo_n).map(move |dup| Rollout::new(batch, p, dup)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(index: usize) -> Problem {
        Problem {
            dataset: "math".into(),
            index,
            question: format!("q{index}"),
            answer: Some("1".into()),
            context: None,
        }
    }

    fn batch() -> BatchRef {
        BatchRef {
            exp_id: "e".into(),
            epoch: 0,
            batch: 0,
            step: 0,
        }
    }

    #[test]
    fn test_stage_order_and_parse() {
        assert!(Stage::Init < Stage::Prepared);
        assert!(Stage::Prepared < Stage::RolledOut);
        assert!(Stage::RolledOut < Stage::Judged);
        for stage in [Stage::Init, Stage::Prepared, Stage::RolledOut, Stage::Judged] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("done".parse::<Stage>().is_err());
    }

    #[test]
    fn test_duplicates_are_contiguous() {
        let problems = vec![problem(3), problem(7), problem(1)];
        let rollouts = duplicate_for_group(&batch(), &problems, 4);
        assert_eq!(rollouts.len(), problems.len() * 4);
        for (i, chunk) in rollouts.chunks(4).enumerate() {
            assert!(chunk.iter().all(|r| r.problem_index == problems[i].index));
            let dups: Vec<_> = chunk.iter().map(|r| r.dup_index).collect();
            assert_eq!(dups, vec![0, 1, 2, 3]);
        }
        assert!(rollouts.iter().all(|r| r.stage == Stage::Init));
    }

    #[test]
    fn test_tool_call_count() {
        let mut r = Rollout::new(&batch(), &problem(0), 0);
        r.transcript = vec![
            Turn::new("user", "q"),
            Turn::tool("python", "print(1)"),
            Turn::new("tool", "1"),
            Turn::new("assistant", "done"),
        ];
        assert_eq!(r.tool_calls(), 2);
    }
}
