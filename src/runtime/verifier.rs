//! Exact-match answer verification.

use anyhow::{bail, Result};

use super::{Verdict, Verifier};
use crate::rollout::types::Rollout;

/// Rewards 1.0 when the extracted answer matches the ground truth after
/// normalization, 0.0 otherwise.
#[derive(Debug, Clone, Default)]
pub struct ExactMatchVerifier;

impl Verifier for ExactMatchVerifier {
    async fn verify(&self, rollout: &Rollout) -> Result<Verdict> {
        let Some(expected) = rollout.answer.as_deref() else {
            bail!("rollout {} has no ground truth", rollout.id);
        };
        let text = rollout.final_text.as_deref().unwrap_or("");
        let got = extract_answer(text);
        if normalize(&got) == normalize(expected) {
            return Ok(Verdict {
                reward: 1.0,
                reasoning: None,
            });
        }
        let reasoning = if got.is_empty() {
            "no answer found in the final output".to_string()
        } else {
            format!("expected '{expected}', got '{got}'")
        };
        Ok(Verdict {
            reward: 0.0,
            reasoning: Some(reasoning),
        })
    }
}

/// The content of the last `\boxed{...}` (nested braces allowed), otherwise
/// the last non-empty line with any `Final answer:` prefix removed.
pub fn extract_answer(text: &str) -> String {
    if let Some(boxed) = last_boxed(text) {
        return boxed.trim().to_string();
    }
    let line = text.lines().map(str::trim).filter(|l| !l.is_empty()).last().unwrap_or("");
    let lower = line.to_ascii_lowercase();
    match lower.find("final answer") {
        Some(pos) => line[pos + "final answer".len()..]
            .trim_start_matches([':', ' ', '*'])
            .trim()
            .to_string(),
        None => line.to_string(),
    }
}

fn last_boxed(text: &str) -> Option<&str> {
    let start = text.rfind("\\boxed{")? + "\\boxed{".len();
    let mut depth = 1usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn normalize(answer: &str) -> String {
    answer
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$')
        .collect::<String>()
        .trim_end_matches('.')
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::rollout_with;

    #[test]
    fn test_extract_answer() {
        assert_eq!(extract_answer("so \\boxed{1} then \\boxed{\\frac{1}{2}}"), "\\frac{1}{2}");
        assert_eq!(extract_answer("work\n\nFinal Answer: 42\n"), "42");
        assert_eq!(extract_answer("just 7"), "just 7");
        assert_eq!(extract_answer(""), "");
    }

    #[tokio::test]
    async fn test_verify_rewards() {
        let v = ExactMatchVerifier;
        let hit = rollout_with(Some("Paris"), "The capital is \\boxed{ paris }.");
        assert_eq!(v.verify(&hit).await.unwrap().reward, 1.0);

        let miss = rollout_with(Some("4"), "\\boxed{5}");
        let verdict = v.verify(&miss).await.unwrap();
        assert_eq!(verdict.reward, 0.0);
        assert_eq!(verdict.reasoning.as_deref(), Some("expected '4', got '5'"));

        let no_truth = rollout_with(None, "\\boxed{5}");
        assert!(v.verify(&no_truth).await.is_err());
    }
}
