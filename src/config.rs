use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::retry::RetryPolicy;
use crate::model::QueryParams;

/// Complete configuration for a training-free GRPO run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Experiment identifier. Rollouts, caches, the mistake bank and the
    /// hierarchical store are all keyed by it.
    pub exp_id: String,
    pub data: DataConfig,
    pub practice: PracticeConfig,
    pub experience: ExperienceConfig,
    pub hierarchical: HierarchicalConfig,
    pub mistake_bank: MistakeBankConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
}

/// Where problems come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// JSONL file with the practice problems.
    pub train_path: PathBuf,
    /// Dataset name recorded on every rollout (default: "train").
    pub train_name: String,
    /// Optional JSONL evaluation set.
    pub eval_path: Option<PathBuf>,
    pub eval_name: String,
    /// Truncate each epoch's pool to this many problems.
    pub epoch_size: Option<usize>,
    /// Shuffle the pool at the start of each epoch (seeded).
    pub shuffle: bool,
}

/// Rollout and judging parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PracticeConfig {
    /// Number of passes over the (possibly truncated) data.
    pub epochs: usize,
    /// Rollouts per batch. Must be a multiple of `grpo_n`.
    pub batch_size: usize,
    /// Group size: duplicate rollouts per problem.
    pub grpo_n: usize,
    pub rollout_concurrency: usize,
    pub judge_concurrency: usize,
    /// Timeout for one agent-runtime attempt, in seconds.
    pub task_timeout_secs: u64,
    /// Attempts per rollout before it is dropped from the batch.
    pub max_retries: usize,
    /// Rewards at or above this value count as a success (default: 0.5).
    pub success_threshold: f64,
    pub seed: u64,
    /// `None` reuses every cached step, `Some(0)` recomputes everything,
    /// `Some(n)` reuses steps `< n`.
    pub restart_step: Option<usize>,
    /// Evaluate every N steps (0 disables evaluation).
    pub eval_every_steps: usize,
    /// Attempts per problem during evaluation (the K in pass@K).
    pub eval_grpo_n: usize,
}

/// Experience synthesis parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperienceConfig {
    /// Candidate lessons requested per problem in the group-advantage stage.
    pub num_experiences_per_query: usize,
    /// Concurrency for summary and advantage calls. Kept below the rollout
    /// concurrency since critique calls hit rate limits first.
    pub concurrency: usize,
    /// Whole-call retries for the batch reconciliation stage.
    pub batch_update_retries: usize,
    /// Show the ground truth to the summarizer.
    pub given_ground_truth: bool,
    pub llm_max_attempts: usize,
    pub llm_base_delay_ms: u64,
    pub llm_max_delay_ms: u64,
    /// Also retry `Transient` errors (rate limits are always retried).
    pub retry_transient: bool,
}

/// Hierarchical (L0/L1/L2) compaction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchicalConfig {
    pub enabled: bool,
    pub l1_aggregation_threshold: usize,
    pub l2_aggregation_threshold: usize,
    /// Most recent L0 entries included in the agent-facing text.
    pub max_l0_in_prompt: usize,
    /// How many recent L0 entries are checked for near-duplicates.
    pub dedup_window: usize,
    /// Token-Jaccard similarity at or above which an L0 is a duplicate.
    pub dedup_similarity: f64,
}

/// Mistake bank parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MistakeBankConfig {
    pub enabled: bool,
    /// Fraction of each epoch drawn from the failure pool.
    pub focus_ratio: f64,
    /// A new failure text replaces the active one only below this similarity.
    pub overwrite_similarity: f64,
    /// Existing failure texts in the same context at or above this similarity
    /// are reused verbatim.
    pub reuse_similarity: f64,
}

/// Model endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,
    pub api_key: String,
    /// Model used for summaries, critiques, diffs and hierarchy synthesis.
    pub critic_model_id: String,
    /// Model driving the agent runtime.
    pub policy_model_id: String,
    pub temperature: f64,
    pub max_tokens: usize,
    pub request_timeout_secs: u64,
    /// Optional system instructions for the agent runtime.
    pub agent_instructions: String,
    /// Replies allowed per agent run before it is cut off.
    pub agent_max_turns: usize,
    /// Prefix agent user turns with a `[Turn t/T]` counter.
    pub agent_turn_counter: bool,
    /// Truncate agent output to this many characters.
    pub agent_max_output_chars: Option<usize>,
}

/// File locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds `rollouts.sqlite`, the mistake bank and the hierarchy store.
    pub workdir: PathBuf,
    /// Optional YAML agent configuration to append experiences to.
    pub agent_template: Option<PathBuf>,
    /// Where the materialized agent configuration is written. Defaults to
    /// `<workdir>/<exp_id>_agent.yaml`.
    pub output_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            exp_id: format!("exp-{}", &short[..8]),
            data: DataConfig::default(),
            practice: PracticeConfig::default(),
            experience: ExperienceConfig::default(),
            hierarchical: HierarchicalConfig::default(),
            mistake_bank: MistakeBankConfig::default(),
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path: PathBuf::from("data/train.jsonl"),
            train_name: "train".into(),
            eval_path: None,
            eval_name: "eval".into(),
            epoch_size: None,
            shuffle: true,
        }
    }
}

impl Default for PracticeConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 64,
            grpo_n: 5,
            rollout_concurrency: 64,
            judge_concurrency: 64,
            task_timeout_secs: 3600,
            max_retries: 3,
            success_threshold: 0.5,
            seed: 42,
            restart_step: None,
            eval_every_steps: 0,
            eval_grpo_n: 1,
        }
    }
}

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self {
            num_experiences_per_query: 1,
            concurrency: 16,
            batch_update_retries: 3,
            given_ground_truth: true,
            llm_max_attempts: 5,
            llm_base_delay_ms: 1_000,
            llm_max_delay_ms: 60_000,
            retry_transient: false,
        }
    }
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            l1_aggregation_threshold: 5,
            l2_aggregation_threshold: 3,
            max_l0_in_prompt: 10,
            dedup_window: 200,
            dedup_similarity: 0.95,
        }
    }
}

impl Default for MistakeBankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            focus_ratio: 0.3,
            overwrite_similarity: 0.92,
            reuse_similarity: 0.97,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            critic_model_id: "gpt-4o".into(),
            policy_model_id: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 4096,
            request_timeout_secs: 300,
            agent_instructions: String::new(),
            agent_max_turns: 1,
            agent_turn_counter: false,
            agent_max_output_chars: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("workdir"),
            agent_template: None,
            output_path: None,
        }
    }
}

impl Config {
    /// Read a JSON configuration file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Check every precondition that must hold before a run starts.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.validate_settings()?;
        if !self.data.train_path.exists() {
            return Err(ConfigError::MissingDataset(
                self.data.train_path.display().to_string(),
            ));
        }
        if let Some(eval) = &self.data.eval_path {
            if !eval.exists() {
                return Err(ConfigError::MissingDataset(eval.display().to_string()));
            }
        }
        Ok(())
    }

    /// The checks of [`validate`](Self::validate) that do not touch the
    /// filesystem.
    pub fn validate_settings(&self) -> std::result::Result<(), ConfigError> {
        let p = &self.practice;
        if p.grpo_n == 0 {
            return Err(ConfigError::Zero { field: "grpo_n" });
        }
        if p.batch_size == 0 || p.batch_size % p.grpo_n != 0 {
            return Err(ConfigError::BatchNotDivisible {
                batch_size: p.batch_size,
                grpo_n: p.grpo_n,
            });
        }
        for (field, value) in [
            ("rollout_concurrency", p.rollout_concurrency),
            ("judge_concurrency", p.judge_concurrency),
            ("max_retries", p.max_retries),
            ("experience.concurrency", self.experience.concurrency),
            ("experience.llm_max_attempts", self.experience.llm_max_attempts),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.hierarchical.enabled {
            if self.hierarchical.l1_aggregation_threshold == 0 {
                return Err(ConfigError::Zero {
                    field: "l1_aggregation_threshold",
                });
            }
            if self.hierarchical.l2_aggregation_threshold == 0 {
                return Err(ConfigError::Zero {
                    field: "l2_aggregation_threshold",
                });
            }
        }
        for (field, value) in [
            ("mistake_bank.focus_ratio", self.mistake_bank.focus_ratio),
            (
                "mistake_bank.overwrite_similarity",
                self.mistake_bank.overwrite_similarity,
            ),
            ("mistake_bank.reuse_similarity", self.mistake_bank.reuse_similarity),
            ("hierarchical.dedup_similarity", self.hierarchical.dedup_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        Ok(())
    }

    /// Problems per batch (`batch_size / grpo_n`).
    pub fn problems_per_batch(&self) -> usize {
        self.practice.batch_size / self.practice.grpo_n.max(1)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.practice.task_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.experience.llm_max_attempts,
            base_delay: Duration::from_millis(self.experience.llm_base_delay_ms),
            max_delay: Duration::from_millis(self.experience.llm_max_delay_ms),
            multiplier: 2.0,
            retry_transient: self.experience.retry_transient,
        }
    }

    pub fn query_params(&self) -> QueryParams {
        QueryParams {
            temperature: self.model.temperature,
            max_tokens: self.model.max_tokens,
        }
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.storage.workdir.join("rollouts.sqlite")
    }

    pub fn mistake_bank_path(&self) -> PathBuf {
        self.storage
            .workdir
            .join("mistake_bank")
            .join(format!("{}.json", self.exp_id))
    }

    pub fn hierarchy_path(&self) -> PathBuf {
        self.storage
            .workdir
            .join("hierarchy")
            .join(format!("{}.json", self.exp_id))
    }

    pub fn output_path(&self) -> PathBuf {
        self.storage.output_path.clone().unwrap_or_else(|| {
            self.storage
                .workdir
                .join(format!("{}_agent.yaml", self.exp_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_dataset() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, "{\"question\": \"1+1?\", \"answer\": \"2\"}\n").unwrap();
        let mut config = Config::default();
        config.data.train_path = path;
        config.practice.batch_size = 8;
        config.practice.grpo_n = 4;
        (dir, config)
    }

    #[test]
    fn test_default_validates_with_dataset() {
        let (_dir, config) = config_with_dataset();
        assert!(config.validate().is_ok());
        assert_eq!(config.problems_per_batch(), 2);
        assert!(config.exp_id.starts_with("exp-"));
    }

    #[test]
    fn test_batch_not_divisible_is_fatal() {
        let (_dir, mut config) = config_with_dataset();
        config.practice.batch_size = 10;
        assert_eq!(
            config.validate(),
            Err(ConfigError::BatchNotDivisible {
                batch_size: 10,
                grpo_n: 4
            })
        );
    }

    #[test]
    fn test_missing_dataset_is_fatal() {
        let mut config = Config::default();
        config.data.train_path = PathBuf::from("/nonexistent/train.jsonl");
        config.practice.batch_size = 10;
        config.practice.grpo_n = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDataset(_))
        ));
    }

    #[test]
    fn test_focus_ratio_out_of_range() {
        let (_dir, mut config) = config_with_dataset();
        config.mistake_bank.focus_ratio = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "mistake_bank.focus_ratio",
                ..
            })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"exp_id": "demo", "practice": {"grpo_n": 2, "batch_size": 4}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.exp_id, "demo");
        assert_eq!(config.practice.grpo_n, 2);
        assert_eq!(config.practice.epochs, 3);
        assert!((config.mistake_bank.focus_ratio - 0.3).abs() < 1e-9);
        assert_eq!(
            config.mistake_bank_path(),
            PathBuf::from("workdir/mistake_bank/demo.json")
        );
    }
}
