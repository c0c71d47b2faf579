//! Problem datasets.
//!
//! Datasets are JSONL files, one problem per line. The loader accepts the
//! common field spellings (`question`/`problem`, `answer`/`groundtruth`) and an
//! optional declared context (`context` or `game_name`) that the mistake bank
//! uses to scope failure-text reuse.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Identity of one problem: dataset name plus index within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProblemKey {
    pub dataset: String,
    pub index: usize,
}

impl fmt::Display for ProblemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.index)
    }
}

/// One problem instance the agent is asked to solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub dataset: String,
    pub index: usize,
    pub question: String,
    /// Ground truth, when the dataset provides one.
    pub answer: Option<String>,
    /// Declared game / context label.
    pub context: Option<String>,
}

impl Problem {
    pub fn key(&self) -> ProblemKey {
        ProblemKey {
            dataset: self.dataset.clone(),
            index: self.index,
        }
    }
}

#[derive(Deserialize)]
struct RawProblem {
    #[serde(alias = "problem")]
    question: String,
    #[serde(default, alias = "groundtruth", alias = "ground_truth")]
    answer: Option<serde_json::Value>,
    #[serde(default, alias = "game_name")]
    context: Option<String>,
}

/// Load a JSONL dataset. Blank lines are skipped; a malformed line is an error.
pub fn load_jsonl(path: &Path, name: &str) -> Result<Vec<Problem>> {
    if !path.exists() {
        return Err(ConfigError::MissingDataset(path.display().to_string()).into());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;
    let problems = parse_jsonl(&text, name)
        .with_context(|| format!("Failed to parse dataset {}", path.display()))?;
    if problems.is_empty() {
        return Err(ConfigError::EmptyDataset(path.display().to_string()).into());
    }
    tracing::info!(path = %path.display(), dataset = name, problems = problems.len(), "Loaded dataset");
    Ok(problems)
}

fn parse_jsonl(text: &str, name: &str) -> Result<Vec<Problem>> {
    let mut problems = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawProblem = serde_json::from_str(line)
            .with_context(|| format!("line {}: invalid problem record", line_no + 1))?;
        let answer = raw.answer.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        problems.push(Problem {
            dataset: name.to_string(),
            index: problems.len(),
            question: raw.question,
            answer,
            context: raw.context,
        });
    }
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_aliases() {
        let text = r#"{"question": "What is 2+2?", "answer": "4"}

{"problem": "Solve x", "groundtruth": 7, "game_name": "sudoku"}
"#;
        let problems = parse_jsonl(text, "math").unwrap();
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].answer.as_deref(), Some("4"));
        assert_eq!(problems[1].index, 1);
        assert_eq!(problems[1].answer.as_deref(), Some("7"));
        assert_eq!(problems[1].context.as_deref(), Some("sudoku"));
        assert_eq!(problems[1].key().to_string(), "math:1");
    }

    #[test]
    fn test_malformed_line_is_error() {
        assert!(parse_jsonl("{\"answer\": 1}\n", "x").is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_jsonl(Path::new("/nope/data.jsonl"), "x").unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
