//! Scripted fakes for the collaborator traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;

use crate::data::Problem;
use crate::error::LlmError;
use crate::model::{LlmClient, QueryParams};
use crate::rollout::types::{BatchRef, Rollout, Stage, Turn};
use crate::runtime::{AgentRuntime, RunOutput, Verdict, Verifier};

pub const DATASET: &str = "train";

pub fn problems(n: usize) -> Vec<Problem> {
    (0..n)
        .map(|i| Problem {
            dataset: DATASET.into(),
            index: i,
            question: format!("q{i}"),
            answer: Some("1".into()),
            context: None,
        })
        .collect()
}

static NEXT_ROLLOUT_ID: AtomicI64 = AtomicI64::new(1);

/// Judged rollouts for problem `index`, one per reward. Every call hands out
/// fresh, increasing rollout ids.
pub fn judged_group(index: usize, rewards: &[f64]) -> Vec<Rollout> {
    let batch = BatchRef {
        exp_id: "exp".into(),
        epoch: 0,
        batch: 0,
        step: 0,
    };
    let problem = &problems(index + 1)[index];
    rewards
        .iter()
        .enumerate()
        .map(|(dup, reward)| {
            let mut r = Rollout::new(&batch, problem, dup);
            r.id = NEXT_ROLLOUT_ID.fetch_add(1, Ordering::SeqCst);
            r.transcript = Vec::new();
            r.final_text = Some(if *reward >= 0.5 { "\\boxed{1}" } else { "\\boxed{0}" }.into());
            r.reward = Some(*reward);
            r.stage = Stage::Judged;
            r
        })
        .collect()
}

pub fn rollout_with(answer: Option<&str>, final_text: &str) -> Rollout {
    let mut problem = problems(1).remove(0);
    problem.answer = answer.map(str::to_string);
    let batch = BatchRef {
        exp_id: "exp".into(),
        epoch: 0,
        batch: 0,
        step: 0,
    };
    let mut r = Rollout::new(&batch, &problem, 0);
    r.final_text = Some(final_text.into());
    r.stage = Stage::RolledOut;
    r
}

// ---------------------------------------------------------------------------
// ScriptedLlm
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    prompts: Mutex<Vec<String>>,
    batch_update_response: Option<String>,
    summary_error: Option<LlmError>,
    synthesis_error: Option<LlmError>,
    agent_reply: Option<String>,
}

/// Routes each query on markers in the user prompt and records every prompt.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Script>,
}

impl ScriptedLlm {
    fn edit(mut self, f: impl FnOnce(&mut Script)) -> Self {
        let script = Arc::get_mut(&mut self.script).expect("configure before cloning");
        f(script);
        self
    }

    pub fn with_batch_update_response(self, response: &str) -> Self {
        self.edit(|s| s.batch_update_response = Some(response.into()))
    }

    pub fn failing_summaries(self, err: LlmError) -> Self {
        self.edit(|s| s.summary_error = Some(err))
    }

    pub fn failing_synthesis(self, err: LlmError) -> Self {
        self.edit(|s| s.synthesis_error = Some(err))
    }

    pub fn with_agent_reply(self, reply: &str) -> Self {
        self.edit(|s| s.agent_reply = Some(reply.into()))
    }

    pub fn total_calls(&self) -> usize {
        self.script.prompts.lock().unwrap().len()
    }

    pub fn calls_with(&self, marker: &str) -> usize {
        self.script
            .prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(marker))
            .count()
    }

    fn respond(&self, user: &str) -> Result<String, LlmError> {
        if user.contains("Summarize the attempt") {
            if let Some(err) = &self.script.summary_error {
                return Err(err.clone());
            }
            return Ok("The agent computed the answer directly and stated it.".into());
        }
        if user.contains("<Experiences>") {
            let question = section_after(user, "Problem:\n").unwrap_or("the problem");
            return Ok(format!(
                "The attempts differ in how they checked the result.\n<Experiences>\n1. When solving {question}, re-check the final step against the question.\n</Experiences>"
            ));
        }
        if user.contains("Produce the final revision plan") {
            if let Some(response) = &self.script.batch_update_response {
                return Ok(response.clone());
            }
            let ops = user
                .split_once("Proposed operations (JSON, possibly conflicting):\n")
                .and_then(|(_, rest)| rest.split_once("\n\nProduce the final revision plan"))
                .map(|(json, _)| json.to_string())
                .unwrap_or_else(|| "[]".into());
            return Ok(ops);
        }
        if user.contains("Candidate experiences:") {
            let ops: Vec<serde_json::Value> = user
                .split_once("Candidate experiences:\n")
                .map(|(_, rest)| rest)
                .unwrap_or("")
                .lines()
                .take_while(|l| !l.trim().is_empty())
                .filter_map(|l| l.strip_prefix("- "))
                .map(|c| serde_json::json!({"operation": "ADD", "content": c}))
                .collect();
            return Ok(serde_json::to_string(&ops).unwrap_or_default());
        }
        if user.contains("Write the shared pattern.") || user.contains("Write the meta-strategy.") {
            if let Some(err) = &self.script.synthesis_error {
                return Err(err.clone());
            }
            return Ok("Re-check the final step of every solution.".into());
        }
        Ok(self
            .script
            .agent_reply
            .clone()
            .unwrap_or_else(|| "\\boxed{1}".into()))
    }
}

/// The first line following `header`.
fn section_after<'a>(text: &'a str, header: &str) -> Option<&'a str> {
    text.split_once(header)
        .and_then(|(_, rest)| rest.lines().next())
        .map(str::trim)
}

impl LlmClient for ScriptedLlm {
    async fn query(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _params: &QueryParams,
    ) -> Result<String, LlmError> {
        self.script.prompts.lock().unwrap().push(user_prompt.to_string());
        self.respond(user_prompt)
    }
}

// ---------------------------------------------------------------------------
// FixedAgent
// ---------------------------------------------------------------------------

/// Answers every prompt with the same text, optionally failing the first
/// `fail_first` calls or sleeping before answering.
pub struct FixedAgent {
    answer: String,
    fail_first: usize,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FixedAgent {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.into(),
            fail_first: 0,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::answering("\\boxed{1}")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentRuntime for FixedAgent {
    async fn run(&self, prompt: &str) -> anyhow::Result<RunOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            bail!("scripted agent failure {n}");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(RunOutput {
            transcript: vec![Turn::new("user", prompt), Turn::new("assistant", self.answer.clone())],
            final_text: self.answer.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// RewardTableVerifier
// ---------------------------------------------------------------------------

/// Rewards by problem index; unknown problems score 0.
pub struct RewardTableVerifier {
    rewards: HashMap<usize, f64>,
}

impl RewardTableVerifier {
    pub fn new(table: &[(usize, f64)]) -> Self {
        Self {
            rewards: table.iter().copied().collect(),
        }
    }
}

impl Verifier for RewardTableVerifier {
    async fn verify(&self, rollout: &Rollout) -> anyhow::Result<Verdict> {
        let reward = self.rewards.get(&rollout.problem_index).copied().unwrap_or(0.0);
        Ok(Verdict {
            reward,
            reasoning: (reward < 0.5).then(|| format!("wrong answer for problem {}", rollout.problem_index)),
        })
    }
}
