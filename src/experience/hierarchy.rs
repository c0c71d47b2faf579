//! Three-tier compaction of the flat experience stream.
//!
//! - **L0**: one case-specific lesson, tagged with a `scope_key`.
//! - **L1**: a pattern synthesized from `l1_aggregation_threshold`
//!   not-yet-aggregated L0 entries.
//! - **L2**: a meta-strategy synthesized from `l2_aggregation_threshold`
//!   not-yet-aggregated L1 entries plus the L0 entries they came from.
//!
//! Entries are append-only. Each L0 feeds at most one L1 and each L1 at most
//! one L2. The whole state is rewritten to a JSON file after every
//! [`process_step`](HierarchicalExperienceManager::process_step) call.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::map::ExperienceMap;
use super::similarity::{jaccard, scope_key};
use crate::config::HierarchicalConfig;
use crate::model::prompt;
use crate::model::{LlmClient, QueryParams, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L0Entry {
    pub id: String,
    pub content: String,
    pub scope_key: String,
    pub step: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L1Entry {
    pub id: String,
    pub content: String,
    pub source_l0_ids: Vec<String>,
    pub step: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Entry {
    pub id: String,
    pub content: String,
    pub source_l1_ids: Vec<String>,
    pub step: usize,
    pub created_at: DateTime<Utc>,
}

/// Persisted L0/L1/L2 state, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HierarchyState {
    #[serde(default)]
    pub l0: Vec<L0Entry>,
    #[serde(default)]
    pub l1: Vec<L1Entry>,
    #[serde(default)]
    pub l2: Vec<L2Entry>,
}

impl HierarchyState {
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize hierarchy")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write hierarchy to {}", path.display()))?;
        debug!(
            path = %path.display(),
            l0 = self.l0.len(),
            l1 = self.l1.len(),
            l2 = self.l2.len(),
            "Saved hierarchy"
        );
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hierarchy from {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse hierarchy from {}", path.display()))
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// L0 entries not referenced by any L1, oldest first.
    pub fn unaggregated_l0(&self) -> Vec<&L0Entry> {
        let used: HashSet<&str> = self
            .l1
            .iter()
            .flat_map(|e| e.source_l0_ids.iter().map(String::as_str))
            .collect();
        self.l0.iter().filter(|e| !used.contains(e.id.as_str())).collect()
    }

    /// L1 entries not referenced by any L2, oldest first.
    pub fn unaggregated_l1(&self) -> Vec<&L1Entry> {
        let used: HashSet<&str> = self
            .l2
            .iter()
            .flat_map(|e| e.source_l1_ids.iter().map(String::as_str))
            .collect();
        self.l1.iter().filter(|e| !used.contains(e.id.as_str())).collect()
    }

    /// The state as it stood after `step`: entries created later are dropped.
    pub fn as_of(&self, step: usize) -> Self {
        Self {
            l0: self.l0.iter().filter(|e| e.step <= step).cloned().collect(),
            l1: self.l1.iter().filter(|e| e.step <= step).cloned().collect(),
            l2: self.l2.iter().filter(|e| e.step <= step).cloned().collect(),
        }
    }

    /// Agent-facing text: every L2, every L1, then the `max_l0` most recent L0.
    pub fn assemble_text(&self, max_l0: usize) -> String {
        let skip = self.l0.len().saturating_sub(max_l0);
        self.l2
            .iter()
            .map(|e| format!("[L2] {}", e.content))
            .chain(self.l1.iter().map(|e| format!("[L1] {}", e.content)))
            .chain(self.l0.iter().skip(skip).map(|e| format!("[L0] {}", e.content)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What one [`process_step`](HierarchicalExperienceManager::process_step) did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    pub inserted_l0: usize,
    pub skipped_duplicates: usize,
    pub created_l1: usize,
    pub created_l2: usize,
}

/// Flat entries present in `new` but not in `old`, in `new`'s order.
pub fn new_flat_entries<'a>(old: &ExperienceMap, new: &'a ExperienceMap) -> Vec<&'a str> {
    let known: HashSet<&str> = old.values().collect();
    new.values().filter(|v| !known.contains(v)).collect()
}

pub struct HierarchicalExperienceManager<L: LlmClient> {
    client: L,
    policy: RetryPolicy,
    params: QueryParams,
    settings: HierarchicalConfig,
    path: PathBuf,
    state: HierarchyState,
}

impl<L: LlmClient> HierarchicalExperienceManager<L> {
    /// Resume from `path` if present.
    pub fn open(
        client: L,
        policy: RetryPolicy,
        params: QueryParams,
        settings: HierarchicalConfig,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let state = HierarchyState::load_or_default(&path)?;
        if !state.l0.is_empty() {
            info!(
                path = %path.display(),
                l0 = state.l0.len(),
                l1 = state.l1.len(),
                l2 = state.l2.len(),
                "Resumed hierarchy"
            );
        }
        Ok(Self {
            client,
            policy,
            params,
            settings,
            path,
            state,
        })
    }

    pub fn state(&self) -> &HierarchyState {
        &self.state
    }

    pub fn client(&self) -> &L {
        &self.client
    }

    pub fn assemble_text(&self) -> String {
        self.state.assemble_text(self.settings.max_l0_in_prompt)
    }

    /// Feed the entries that one update cycle added, compact, and persist.
    pub async fn process_step(
        &mut self,
        step: usize,
        old: &ExperienceMap,
        new: &ExperienceMap,
    ) -> Result<CompactionReport> {
        let mut report = CompactionReport::default();
        for content in new_flat_entries(old, new) {
            if !self.insert_l0(step, content) {
                report.skipped_duplicates += 1;
                continue;
            }
            report.inserted_l0 += 1;
            if self.try_aggregate_l1(step).await {
                report.created_l1 += 1;
                if self.try_aggregate_l2(step).await {
                    report.created_l2 += 1;
                }
            }
        }
        // A previous L2 attempt may have failed with enough L1 waiting.
        if report.created_l1 == 0 && self.try_aggregate_l2(step).await {
            report.created_l2 += 1;
        }
        self.state.save_to_file(&self.path)?;
        info!(
            step,
            inserted_l0 = report.inserted_l0,
            skipped = report.skipped_duplicates,
            created_l1 = report.created_l1,
            created_l2 = report.created_l2,
            "Hierarchy updated"
        );
        Ok(report)
    }

    /// Insert one L0 unless a near-duplicate exists in the same scope within
    /// the recent window. Returns whether it was inserted.
    pub fn insert_l0(&mut self, step: usize, content: &str) -> bool {
        let scope = scope_key(content);
        let window_start = self.state.l0.len().saturating_sub(self.settings.dedup_window);
        let duplicate = self.state.l0[window_start..]
            .iter()
            .filter(|e| e.scope_key == scope)
            .any(|e| jaccard(&e.content, content) >= self.settings.dedup_similarity);
        if duplicate {
            debug!(scope = %scope, "Skipped near-duplicate L0");
            return false;
        }
        let id = format!("L0-{}", self.state.l0.len());
        self.state.l0.push(L0Entry {
            id,
            content: content.to_string(),
            scope_key: scope,
            step,
            created_at: Utc::now(),
        });
        true
    }

    async fn try_aggregate_l1(&mut self, step: usize) -> bool {
        let threshold = self.settings.l1_aggregation_threshold.max(1);
        let pending = self.state.unaggregated_l0();
        if pending.len() < threshold {
            return false;
        }
        let chosen: Vec<&L0Entry> = pending.into_iter().take(threshold).collect();
        let source_ids: Vec<String> = chosen.iter().map(|e| e.id.clone()).collect();
        let cases: Vec<&str> = chosen.iter().map(|e| e.content.as_str()).collect();
        let (system, user) = prompt::l1_synthesis(&cases);

        let content = match self.synthesize("l1_synthesis", &system, &user).await {
            Some(c) => c,
            None => return false,
        };
        let id = format!("L1-{}", self.state.l1.len());
        info!(id = %id, sources = source_ids.len(), "Synthesized L1 pattern");
        self.state.l1.push(L1Entry {
            id,
            content,
            source_l0_ids: source_ids,
            step,
            created_at: Utc::now(),
        });
        true
    }

    async fn try_aggregate_l2(&mut self, step: usize) -> bool {
        let threshold = self.settings.l2_aggregation_threshold.max(1);
        let pending = self.state.unaggregated_l1();
        if pending.len() < threshold {
            return false;
        }
        let chosen: Vec<&L1Entry> = pending.into_iter().take(threshold).collect();
        let source_ids: Vec<String> = chosen.iter().map(|e| e.id.clone()).collect();
        let patterns: Vec<&str> = chosen.iter().map(|e| e.content.as_str()).collect();
        let l0_ids: HashSet<&str> = chosen
            .iter()
            .flat_map(|e| e.source_l0_ids.iter().map(String::as_str))
            .collect();
        let cases: Vec<&str> = self
            .state
            .l0
            .iter()
            .filter(|e| l0_ids.contains(e.id.as_str()))
            .map(|e| e.content.as_str())
            .collect();
        let (system, user) = prompt::l2_synthesis(&patterns, &cases);

        let content = match self.synthesize("l2_synthesis", &system, &user).await {
            Some(c) => c,
            None => return false,
        };
        let id = format!("L2-{}", self.state.l2.len());
        info!(id = %id, sources = source_ids.len(), "Synthesized L2 meta-strategy");
        self.state.l2.push(L2Entry {
            id,
            content,
            source_l1_ids: source_ids,
            step,
            created_at: Utc::now(),
        });
        true
    }

    async fn synthesize(&self, label: &str, system: &str, user: &str) -> Option<String> {
        let result = self
            .policy
            .run(label, || self.client.query(system, user, &self.params))
            .await;
        match result {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                warn!(label, "Empty synthesis, inputs left unaggregated");
                None
            }
            Err(e) => {
                warn!(label, error = %e, "Synthesis failed, inputs left unaggregated");
                None
            }
        }
    }
}
