//! Chat-completion agent with explicit pre/post hooks.

use anyhow::Result;
use tracing::debug;

use super::{AgentRuntime, RunOutput};
use crate::model::{ChatMessage, LlmClient, QueryParams};
use crate::rollout::types::Turn;

const CONTINUE_PROMPT: &str =
    "Continue. When you are done, give your final answer in the form \\boxed{answer}.";

/// Context injection and output post-processing around an agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentHooks {
    /// Prefix every user turn with `[Turn t/T]`.
    pub inject_turn_counter: bool,
    /// Truncate every assistant turn and the final text to this many chars.
    pub max_output_chars: Option<usize>,
}

impl AgentHooks {
    /// Applied to every user message before it is sent.
    pub fn before_turn(&self, content: &str, turn: usize, max_turns: usize) -> String {
        if self.inject_turn_counter {
            format!("[Turn {turn}/{max_turns}]\n{content}")
        } else {
            content.to_string()
        }
    }

    /// Applied to the finished run.
    pub fn after_run(&self, mut output: RunOutput) -> RunOutput {
        let Some(limit) = self.max_output_chars else {
            return output;
        };
        for turn in output.transcript.iter_mut().filter(|t| t.role == "assistant") {
            truncate_chars(&mut turn.content, limit);
        }
        truncate_chars(&mut output.final_text, limit);
        output
    }
}

fn truncate_chars(text: &mut String, limit: usize) {
    if let Some((idx, _)) = text.char_indices().nth(limit) {
        text.truncate(idx);
    }
}

/// Whether a reply already commits to an answer.
pub fn has_final_answer(reply: &str) -> bool {
    reply.contains("\\boxed{") || reply.to_ascii_lowercase().contains("final answer")
}

/// Agent that solves a problem through a short chat with the policy model.
///
/// The run stops at the first reply that commits to an answer, or after
/// `max_turns` replies.
pub struct LlmAgent<L: LlmClient> {
    client: L,
    instructions: String,
    params: QueryParams,
    max_turns: usize,
    hooks: AgentHooks,
}

impl<L: LlmClient> LlmAgent<L> {
    pub fn new(client: L, instructions: impl Into<String>, params: QueryParams) -> Self {
        Self {
            client,
            instructions: instructions.into(),
            params,
            max_turns: 1,
            hooks: AgentHooks::default(),
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_hooks(mut self, hooks: AgentHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

impl<L: LlmClient> AgentRuntime for LlmAgent<L> {
    async fn run(&self, prompt: &str) -> Result<RunOutput> {
        let mut messages = Vec::new();
        if !self.instructions.is_empty() {
            messages.push(ChatMessage::system(&self.instructions));
        }
        let first = self.hooks.before_turn(prompt, 1, self.max_turns);
        messages.push(ChatMessage::user(&first));
        let mut transcript = vec![Turn::new("user", first)];

        let mut final_text = String::new();
        for turn in 1..=self.max_turns {
            let reply = self.client.chat(&messages, &self.params).await?;
            transcript.push(Turn::new("assistant", reply.clone()));
            messages.push(ChatMessage::assistant(&reply));
            if has_final_answer(&reply) || turn == self.max_turns {
                final_text = reply;
                break;
            }
            let nudge = self.hooks.before_turn(CONTINUE_PROMPT, turn + 1, self.max_turns);
            messages.push(ChatMessage::user(&nudge));
            transcript.push(Turn::new("user", nudge));
        }
        debug!(turns = transcript.len(), "Agent run finished");

        Ok(self.hooks.after_run(RunOutput {
            transcript,
            final_text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;

    #[test]
    fn test_hooks() {
        let hooks = AgentHooks {
            inject_turn_counter: true,
            max_output_chars: Some(3),
        };
        assert_eq!(hooks.before_turn("hi", 2, 5), "[Turn 2/5]\nhi");
        let out = hooks.after_run(RunOutput {
            transcript: vec![Turn::new("user", "question"), Turn::new("assistant", "abcdef")],
            final_text: "héllo".into(),
        });
        assert_eq!(out.transcript[0].content, "question");
        assert_eq!(out.transcript[1].content, "abc");
        assert_eq!(out.final_text, "hél");
        assert_eq!(AgentHooks::default().before_turn("x", 1, 1), "x");
    }

    #[tokio::test]
    async fn test_single_turn_run() {
        let llm = ScriptedLlm::default().with_agent_reply("The sum is \\boxed{4}");
        let agent = LlmAgent::new(llm, "You are careful.", QueryParams::default());
        let out = agent.run("What is 2+2?").await.unwrap();
        assert_eq!(out.final_text, "The sum is \\boxed{4}");
        assert_eq!(out.transcript.len(), 2);
        assert_eq!(out.transcript[0].role, "user");
    }

    #[tokio::test]
    async fn test_multi_turn_stops_at_max_turns() {
        let llm = ScriptedLlm::default().with_agent_reply("still thinking");
        let agent = LlmAgent::new(llm, "", QueryParams::default())
            .with_max_turns(3)
            .with_hooks(AgentHooks {
                inject_turn_counter: true,
                max_output_chars: None,
            });
        let out = agent.run("puzzle").await.unwrap();
        // user, (assistant, user) x2, assistant
        assert_eq!(out.transcript.len(), 6);
        assert!(out.transcript[2].content.starts_with("[Turn 2/3]"));
        assert_eq!(out.final_text, "still thinking");
    }
}
