//! Prompt templates for the experience engine.
//!
//! Each builder returns a `(system, user)` pair ready for
//! [`LlmClient::query`](crate::model::LlmClient::query). The prompts encode the
//! engine's workflow:
//!
//! - **Problem with experience**: the agent-facing prompt.
//! - **Rollout summary**: what happened in one attempt and why it earned its reward.
//! - **Group advantage**: contrast a group's attempts and propose lessons.
//! - **Group update / batch update**: turn lessons into edit operations.
//! - **Hierarchy synthesis**: compact L0 cases into L1 patterns and L1 into L2.

use crate::rollout::types::Turn;

/// Upper bound on transcript text shown to the summarizer.
pub const MAX_TRANSCRIPT_CHARS: usize = 12_000;

// ---------------------------------------------------------------------------
// Agent prompt
// ---------------------------------------------------------------------------

const PROBLEM_WITH_EXPERIENCE: &str = "Please solve the problem:
{problem}

When solving problems, you MUST first carefully read and understand the helpful instructions and experiences:
{experiences}";

/// Render the prompt handed to the agent runtime. With no experiences the
/// raw question is used as-is.
pub fn problem_with_experience(question: &str, experiences_text: &str) -> String {
    if experiences_text.trim().is_empty() {
        return question.to_string();
    }
    PROBLEM_WITH_EXPERIENCE
        .replace("{problem}", question)
        .replace("{experiences}", experiences_text)
}

// ---------------------------------------------------------------------------
// Stage 1: per-rollout summary
// ---------------------------------------------------------------------------

const SUMMARY_SYSTEM: &str = "You are an expert analyst of agent trajectories. \
Given one attempt of an agent at a problem, describe concisely what the agent did, \
which decisions mattered, and why the attempt earned the reward it received. \
Point out the specific step where it went right or wrong.";

const SUMMARY_PROMPT: &str = "Problem:
{problem}
{ground_truth}
Agent trajectory:
{trajectory}

Final answer:
{answer}

Reward: {reward}
{critique}
Summarize the attempt step by step, then explain in 2-3 sentences why it received this reward.";

pub fn rollout_summary(
    question: &str,
    transcript: &[Turn],
    final_text: &str,
    reward: f64,
    ground_truth: Option<&str>,
    critique: Option<&str>,
) -> (String, String) {
    let ground_truth = ground_truth
        .map(|gt| format!("\nGround truth: {gt}\n"))
        .unwrap_or_default();
    let critique = critique
        .filter(|c| !c.trim().is_empty())
        .map(|c| format!("Verifier critique: {c}\n"))
        .unwrap_or_default();
    let user = SUMMARY_PROMPT
        .replace("{problem}", question)
        .replace("{ground_truth}", &ground_truth)
        .replace("{trajectory}", &format_transcript(transcript, MAX_TRANSCRIPT_CHARS))
        .replace("{answer}", final_text)
        .replace("{reward}", &format!("{reward:.3}"))
        .replace("{critique}", &critique);
    (SUMMARY_SYSTEM.to_string(), user)
}

// ---------------------------------------------------------------------------
// Stage 2: group advantage
// ---------------------------------------------------------------------------

/// Label of one attempt in the group comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLabel {
    Best,
    Worst,
    Other,
    Only,
}

impl AttemptLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptLabel::Best => "BEST",
            AttemptLabel::Worst => "WORST",
            AttemptLabel::Other => "OTHER",
            AttemptLabel::Only => "ONLY",
        }
    }
}

/// One summarized attempt shown in the group comparison.
#[derive(Debug, Clone)]
pub struct LabelledAttempt<'a> {
    pub label: AttemptLabel,
    pub reward: f64,
    pub summary: &'a str,
}

const ADVANTAGE_SYSTEM: &str = "You compare several attempts of an agent at the same problem \
and extract generalizable lessons. Contrast what the better attempts did with what the worse \
attempts did and identify the causal difference. Lessons must be short, actionable, and \
reusable on other problems; never mention this specific problem's numbers or answer.";

const ADVANTAGE_PROMPT: &str = "Problem:
{problem}
{ground_truth}
Attempts:
{attempts}
{note}
First write a short critique comparing the attempts. Then output exactly {n} new experience(s) \
inside the block below, one per line:
<Experiences>
...
</Experiences>";

const EQUAL_REWARD_NOTE: &str = "NOTE: all attempts received the same reward. If they all \
succeeded, extract the pattern that made success robust. If they all failed, identify the \
root cause shared by the failures and how to avoid it.\n";

pub fn group_advantage(
    question: &str,
    ground_truth: Option<&str>,
    attempts: &[LabelledAttempt<'_>],
    all_equal: bool,
    num_experiences: usize,
) -> (String, String) {
    let attempts_text = attempts
        .iter()
        .enumerate()
        .map(|(i, a)| {
            format!(
                "[Attempt {} | {} | reward={:.3}]\n{}\n",
                i + 1,
                a.label.as_str(),
                a.reward,
                a.summary.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let ground_truth = ground_truth
        .map(|gt| format!("Ground truth: {gt}\n"))
        .unwrap_or_default();
    let user = ADVANTAGE_PROMPT
        .replace("{problem}", question)
        .replace("{ground_truth}", &ground_truth)
        .replace("{attempts}", &attempts_text)
        .replace("{note}", if all_equal { EQUAL_REWARD_NOTE } else { "" })
        .replace("{n}", &num_experiences.max(1).to_string());
    (ADVANTAGE_SYSTEM.to_string(), user)
}

/// Extract the lessons inside the last `<Experiences>...</Experiences>` block.
///
/// Leading bullets and list numbering are stripped; blank lines are dropped.
/// Returns `None` when the block is missing.
pub fn parse_experiences_block(response: &str) -> Option<Vec<String>> {
    let lower = response.to_ascii_lowercase();
    let open = "<experiences>";
    let close = "</experiences>";
    let start = lower.rfind(open)? + open.len();
    let end = lower[start..].find(close).map(|e| start + e)?;
    let lessons = response[start..end]
        .lines()
        .map(strip_list_marker)
        .filter(|l| !l.is_empty() && *l != "...")
        .map(str::to_string)
        .collect();
    Some(lessons)
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim();
        }
    }
    line
}

// ---------------------------------------------------------------------------
// Stage 3: group update
// ---------------------------------------------------------------------------

const OPERATIONS_SCHEMA: &str = r#"Respond with a JSON array only. Each element is one of:
  {"operation": "ADD", "content": "<new experience>"}
  {"operation": "UPDATE", "id": "G<n>", "content": "<revised experience>"}
  {"operation": "DELETE", "id": "G<n>"}
  {"operation": "NONE"}"#;

const GROUP_UPDATE_SYSTEM: &str = "You maintain a compact library of experiences for an agent. \
Given candidate new experiences and the current library, decide for each candidate whether to \
ADD it, merge it into an existing entry with UPDATE, DELETE an entry it contradicts or \
supersedes, or do nothing. Keep the library non-redundant and general.";

const GROUP_UPDATE_PROMPT: &str = "Current experiences:
{experiences}

Candidate experiences:
{candidates}

{schema}";

pub fn group_update(current_experiences: &str, candidates: &[String]) -> (String, String) {
    let experiences = if current_experiences.trim().is_empty() {
        "(empty)".to_string()
    } else {
        current_experiences.to_string()
    };
    let candidates = candidates
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");
    let user = GROUP_UPDATE_PROMPT
        .replace("{experiences}", &experiences)
        .replace("{candidates}", &candidates)
        .replace("{schema}", OPERATIONS_SCHEMA);
    (GROUP_UPDATE_SYSTEM.to_string(), user)
}

// ---------------------------------------------------------------------------
// Stage 4: batch update
// ---------------------------------------------------------------------------

const BATCH_UPDATE_SYSTEM: &str = "You reconcile edit proposals that were produced \
independently for different problems. Merge duplicates, resolve contradictory UPDATEs to the \
same id into one, drop proposals made redundant by others, and return one coherent revision \
plan for the library.";

const BATCH_UPDATE_PROMPT: &str = "Current experiences:
{experiences}

Proposed operations (JSON, possibly conflicting):
{operations}

Produce the final revision plan.
{schema}";

pub fn batch_update(current_experiences: &str, operations_json: &str) -> (String, String) {
    let experiences = if current_experiences.trim().is_empty() {
        "(empty)".to_string()
    } else {
        current_experiences.to_string()
    };
    let user = BATCH_UPDATE_PROMPT
        .replace("{experiences}", &experiences)
        .replace("{operations}", operations_json)
        .replace("{schema}", OPERATIONS_SCHEMA);
    (BATCH_UPDATE_SYSTEM.to_string(), user)
}

// ---------------------------------------------------------------------------
// Hierarchy synthesis
// ---------------------------------------------------------------------------

const L1_SYSTEM: &str = "You compress several case-specific lessons into one reusable \
pattern. Keep what recurs across the cases, drop case details, and keep any context tag \
(such as context=... or game_name=...) that all cases share. Answer with the pattern only, \
in at most three sentences.";

const L2_SYSTEM: &str = "You distill several patterns, together with the concrete cases \
they came from, into one meta-strategy: a general principle for approaching problems of this \
kind. Answer with the meta-strategy only, in at most three sentences.";

pub fn l1_synthesis(cases: &[&str]) -> (String, String) {
    let user = format!(
        "Case-specific lessons:\n{}\n\nWrite the shared pattern.",
        numbered(cases)
    );
    (L1_SYSTEM.to_string(), user)
}

pub fn l2_synthesis(patterns: &[&str], cases: &[&str]) -> (String, String) {
    let user = format!(
        "Patterns:\n{}\n\nSupporting cases:\n{}\n\nWrite the meta-strategy.",
        numbered(patterns),
        numbered(cases)
    );
    (L2_SYSTEM.to_string(), user)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn numbered(items: &[&str]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a transcript as `role: content` blocks, keeping the tail when the
/// text exceeds `max_chars`.
pub fn format_transcript(transcript: &[Turn], max_chars: usize) -> String {
    let text = transcript
        .iter()
        .map(|t| match &t.tool_name {
            Some(name) => format!("[{} -> {}]\n{}", t.role, name, t.content),
            None => format!("[{}]\n{}", t.role, t.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...(truncated)...\n{tail}")
}
