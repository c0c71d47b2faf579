//! tfgrpo: training-free GRPO experience learning for LLM agents.
//!
//! Subcommands:
//!
//! - `train`      -- Run the full practice loop and write the agent configuration
//! - `mistakes`   -- Print the mistake bank of an experiment, by sampling priority
//! - `hierarchy`  -- Print the L0/L1/L2 experience store of an experiment
//! - `export`     -- Re-materialize the agent configuration from a cached step

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tfgrpo::config::Config;
use tfgrpo::data::load_jsonl;
use tfgrpo::experience::HierarchyState;
use tfgrpo::mistake::MistakeBank;
use tfgrpo::model::ApiClient;
use tfgrpo::rollout::RolloutStore;
use tfgrpo::runtime::{AgentHooks, ExactMatchVerifier, LlmAgent};
use tfgrpo::training::{materialize_agent_config, TrainingFreeGrpo};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Training-free GRPO: learn agent experiences from grouped rollouts.
#[derive(Parser)]
#[command(name = "tfgrpo", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every epoch of practice and write the agent configuration.
    Train,

    /// Print the mistake bank of an experiment.
    Mistakes {
        exp_id: String,

        /// Only show this many records.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the hierarchical experience store of an experiment.
    Hierarchy { exp_id: String },

    /// Write the agent configuration from cached experiences.
    Export {
        exp_id: String,

        /// Step to export (default: the latest cached step).
        #[arg(long)]
        step: Option<usize>,

        /// Output path (default: the configured output path).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Fill in the API key from the environment when not set in the config file.
    if config.model.api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.model.api_key = key;
        }
    }

    match cli.command {
        Commands::Train => cmd_train(config).await,
        Commands::Mistakes { exp_id, limit } => {
            config.exp_id = exp_id;
            cmd_mistakes(&config, limit)
        }
        Commands::Hierarchy { exp_id } => {
            config.exp_id = exp_id;
            cmd_hierarchy(&config)
        }
        Commands::Export {
            exp_id,
            step,
            output,
        } => {
            config.exp_id = exp_id;
            cmd_export(&config, step, output).await
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_train(config: Config) -> Result<()> {
    config.validate()?;

    let train = load_jsonl(&config.data.train_path, &config.data.train_name)?;
    let eval = match &config.data.eval_path {
        Some(path) => load_jsonl(path, &config.data.eval_name)?,
        None => Vec::new(),
    };

    let store = RolloutStore::open(config.sqlite_path()).await?;
    let timeout = std::time::Duration::from_secs(config.model.request_timeout_secs);
    let critic = ApiClient::new(
        &config.model.api_base,
        &config.model.api_key,
        &config.model.critic_model_id,
        timeout,
    )?;
    let policy = ApiClient::new(
        &config.model.api_base,
        &config.model.api_key,
        &config.model.policy_model_id,
        timeout,
    )?;
    let agent = LlmAgent::new(policy, config.model.agent_instructions.clone(), config.query_params())
        .with_max_turns(config.model.agent_max_turns)
        .with_hooks(AgentHooks {
            inject_turn_counter: config.model.agent_turn_counter,
            max_output_chars: config.model.agent_max_output_chars,
        });

    let mut engine = TrainingFreeGrpo::new(
        config.clone(),
        store,
        critic,
        agent,
        ExactMatchVerifier,
        train,
        eval,
    )?;
    let summary = engine.run().await?;

    println!("Experiment: {}", config.exp_id);
    println!("  Steps: {}", summary.steps.len());
    for record in &summary.steps {
        println!(
            "  step {:>3} (epoch {}, batch {}){}: {}",
            record.step,
            record.epoch,
            record.batch,
            if record.cached { " [cached]" } else { "" },
            record.stats
        );
    }
    for eval in &summary.evals {
        println!("  eval @ step {:>3}: {}", eval.step, eval.stats);
    }
    println!("  Experiences: {}", summary.experiences.len());
    println!("  Agent config: {}", config.output_path().display());
    Ok(())
}

fn cmd_mistakes(config: &Config, limit: Option<usize>) -> Result<()> {
    let path = config.mistake_bank_path();
    if !path.exists() {
        bail!("No mistake bank for {} at {}", config.exp_id, path.display());
    }
    let bank = MistakeBank::open(
        config.exp_id.clone(),
        path.clone(),
        config.mistake_bank.clone(),
        config.practice.success_threshold,
    )?;

    let ranked = bank.ranked(chrono::Utc::now());
    let failed = ranked.iter().filter(|(r, _)| r.failure_experience.is_some()).count();
    println!("Mistake bank: {}", path.display());
    println!("  Records: {} ({failed} with a failure lesson)", bank.len());
    println!();

    for (record, score) in ranked.iter().take(limit.unwrap_or(usize::MAX)) {
        println!(
            "  [{score:.3}] {}  status={:?} attempts={} last_reward={:.3}",
            record.key(),
            record.status,
            record.attempts,
            record.last_reward
        );
        if let Some(ctx) = &record.context {
            println!("    Context: {ctx}");
        }
        if let Some(text) = &record.failure_experience {
            println!("    Failure: {text}");
        }
        if let Some(text) = &record.success_experience {
            println!("    Success: {text}");
        }
        println!(
            "    Updated: {}",
            record.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn cmd_hierarchy(config: &Config) -> Result<()> {
    let path = config.hierarchy_path();
    if !path.exists() {
        bail!("No hierarchy store for {} at {}", config.exp_id, path.display());
    }
    let state = HierarchyState::load_from_file(&path)?;

    println!("Hierarchy: {}", path.display());
    println!(
        "  L0: {}  L1: {}  L2: {}",
        state.l0.len(),
        state.l1.len(),
        state.l2.len()
    );
    println!();

    if !state.l2.is_empty() {
        println!("Meta-strategies (L2):");
        for entry in &state.l2 {
            println!("  [{}] (step {}) {}", entry.id, entry.step, entry.content);
            println!("    From: {}", entry.source_l1_ids.join(", "));
        }
        println!();
    }
    if !state.l1.is_empty() {
        println!("Patterns (L1):");
        for entry in &state.l1 {
            println!("  [{}] (step {}) {}", entry.id, entry.step, entry.content);
            println!("    From: {}", entry.source_l0_ids.join(", "));
        }
        println!();
    }
    println!("Lessons (L0):");
    let pending: Vec<&str> = state.unaggregated_l0().into_iter().map(|e| e.id.as_str()).collect();
    for entry in &state.l0 {
        let marker = if pending.contains(&entry.id.as_str()) { "*" } else { " " };
        println!(
            " {marker}[{}] (step {}, scope {}) {}",
            entry.id, entry.step, entry.scope_key, entry.content
        );
    }
    if !pending.is_empty() {
        println!();
        println!("  * not yet aggregated ({})", pending.len());
    }
    Ok(())
}

async fn cmd_export(config: &Config, step: Option<usize>, output: Option<PathBuf>) -> Result<()> {
    let store = RolloutStore::open(config.sqlite_path()).await?;
    let cached = match step {
        Some(step) => store.load_experiences(&config.exp_id, step).await?,
        None => store.latest_experiences(&config.exp_id).await?,
    }
    .with_context(|| format!("No cached experiences for {}", config.exp_id))?;

    let text = if config.hierarchical.enabled && config.hierarchy_path().exists() {
        HierarchyState::load_from_file(config.hierarchy_path())?
            .as_of(cached.step)
            .assemble_text(config.hierarchical.max_l0_in_prompt)
    } else {
        cached.experiences.format_enumerated()
    };

    let output = output.unwrap_or_else(|| config.output_path());
    materialize_agent_config(config.storage.agent_template.as_deref(), &text, &output)?;

    println!(
        "Exported {} experiences from step {} (epoch {}, batch {}) to {}",
        cached.experiences.len(),
        cached.step,
        cached.epoch,
        cached.batch,
        output.display()
    );
    Ok(())
}
