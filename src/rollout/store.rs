//! SQLite-backed rollout store.
//!
//! The store is the single source of truth for rollout records and for the
//! per-step experience cache. Every stage transition is a guarded update
//! (`WHERE stage = <previous>`), so a record can only move forward and a
//! repeated phase call touches nothing.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::types::{Rollout, Stage, Turn};
use crate::experience::map::ExperienceMap;

/// A cached experience snapshot for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedStep {
    pub step: usize,
    pub epoch: usize,
    pub batch: usize,
    pub experiences: ExperienceMap,
}

#[derive(Clone)]
pub struct RolloutStore {
    conn: Arc<Mutex<Connection>>,
}

impl RolloutStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open rollout store at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "Opened rollout store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rollouts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exp_id TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                batch INTEGER NOT NULL,
                step INTEGER NOT NULL,
                dataset TEXT NOT NULL,
                problem_index INTEGER NOT NULL,
                dup_index INTEGER NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                context TEXT,
                prompt TEXT,
                transcript TEXT NOT NULL DEFAULT '[]',
                final_text TEXT,
                reward REAL,
                critique TEXT,
                stage TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (exp_id, epoch, dataset, problem_index, dup_index)
            );

            CREATE INDEX IF NOT EXISTS idx_rollouts_batch ON rollouts(exp_id, epoch, batch);

            CREATE TABLE IF NOT EXISTS experience_cache (
                exp_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                batch INTEGER NOT NULL,
                experiences TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (exp_id, step)
            );
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rollouts
    // ------------------------------------------------------------------

    /// Insert rollouts, skipping any that collide with an existing
    /// (exp_id, epoch, problem, dup_index). Returns the number inserted.
    pub async fn insert_rollouts(&self, rollouts: &[Rollout]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"INSERT OR IGNORE INTO rollouts
                   (exp_id, epoch, batch, step, dataset, problem_index, dup_index,
                    question, answer, context, prompt, transcript, final_text,
                    reward, critique, stage, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"#,
            )?;
            for r in rollouts {
                inserted += stmt.execute(params![
                    r.exp_id,
                    r.epoch as i64,
                    r.batch as i64,
                    r.step as i64,
                    r.dataset,
                    r.problem_index as i64,
                    r.dup_index as i64,
                    r.question,
                    r.answer,
                    r.context,
                    r.prompt,
                    serde_json::to_string(&r.transcript)?,
                    r.final_text,
                    r.reward,
                    r.critique,
                    r.stage.as_str(),
                    r.created_at.to_rfc3339(),
                    r.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Number of rollouts already created for an epoch.
    pub async fn count_epoch(&self, exp_id: &str, epoch: usize) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rollouts WHERE exp_id = ?1 AND epoch = ?2",
            params![exp_id, epoch as i64],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Batch indexes that have at least one rollout, ascending.
    pub async fn batch_indices(&self, exp_id: &str, epoch: usize) -> Result<Vec<usize>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT DISTINCT batch FROM rollouts WHERE exp_id = ?1 AND epoch = ?2 ORDER BY batch")?;
        let rows = stmt
            .query_map(params![exp_id, epoch as i64], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|b| b as usize).collect())
    }

    /// All rollouts of one batch in creation order (duplicates contiguous).
    pub async fn load_batch(&self, exp_id: &str, epoch: usize, batch: usize) -> Result<Vec<Rollout>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM rollouts WHERE exp_id = ?1 AND epoch = ?2 AND batch = ?3 ORDER BY id"
        ))?;
        let raws = stmt
            .query_map(params![exp_id, epoch as i64, batch as i64], RawRollout::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRollout::into_rollout).collect()
    }

    /// Rollouts of one batch currently in `stage`.
    pub async fn load_batch_in_stage(
        &self,
        exp_id: &str,
        epoch: usize,
        batch: usize,
        stage: Stage,
    ) -> Result<Vec<Rollout>> {
        Ok(self
            .load_batch(exp_id, epoch, batch)
            .await?
            .into_iter()
            .filter(|r| r.stage == stage)
            .collect())
    }

    /// `Init -> Prepared`. Returns `false` if the rollout was not in `Init`.
    pub async fn mark_prepared(&self, id: i64, prompt: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE rollouts SET prompt = ?1, stage = ?2, updated_at = ?3 WHERE id = ?4 AND stage = ?5",
            params![
                prompt,
                Stage::Prepared.as_str(),
                Utc::now().to_rfc3339(),
                id,
                Stage::Init.as_str()
            ],
        )?;
        Ok(n == 1)
    }

    /// `Prepared -> RolledOut`.
    pub async fn mark_rolled_out(&self, id: i64, transcript: &[Turn], final_text: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE rollouts SET transcript = ?1, final_text = ?2, stage = ?3, updated_at = ?4 WHERE id = ?5 AND stage = ?6",
            params![
                serde_json::to_string(transcript)?,
                final_text,
                Stage::RolledOut.as_str(),
                Utc::now().to_rfc3339(),
                id,
                Stage::Prepared.as_str()
            ],
        )?;
        Ok(n == 1)
    }

    /// `RolledOut -> Judged`.
    pub async fn mark_judged(&self, id: i64, reward: f64, critique: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE rollouts SET reward = ?1, critique = ?2, stage = ?3, updated_at = ?4 WHERE id = ?5 AND stage = ?6",
            params![
                reward,
                critique,
                Stage::Judged.as_str(),
                Utc::now().to_rfc3339(),
                id,
                Stage::RolledOut.as_str()
            ],
        )?;
        Ok(n == 1)
    }

    // ------------------------------------------------------------------
    // Experience cache
    // ------------------------------------------------------------------

    pub async fn save_experiences(
        &self,
        exp_id: &str,
        step: usize,
        epoch: usize,
        batch: usize,
        experiences: &ExperienceMap,
    ) -> Result<()> {
        let json = serde_json::to_string(experiences).context("Failed to serialize experiences")?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO experience_cache (exp_id, step, epoch, batch, experiences, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                exp_id,
                step as i64,
                epoch as i64,
                batch as i64,
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub async fn load_experiences(&self, exp_id: &str, step: usize) -> Result<Option<CachedStep>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT step, epoch, batch, experiences FROM experience_cache WHERE exp_id = ?1 AND step = ?2",
                params![exp_id, step as i64],
                read_cached,
            )
            .optional()?;
        row.map(decode_cached).transpose()
    }

    /// The most recent cached step, if any.
    pub async fn latest_experiences(&self, exp_id: &str) -> Result<Option<CachedStep>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT step, epoch, batch, experiences FROM experience_cache WHERE exp_id = ?1 ORDER BY step DESC LIMIT 1",
                params![exp_id],
                read_cached,
            )
            .optional()?;
        row.map(decode_cached).transpose()
    }
}

type RawCached = (i64, i64, i64, String);

fn read_cached(row: &Row<'_>) -> rusqlite::Result<RawCached> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_cached((step, epoch, batch, json): RawCached) -> Result<CachedStep> {
    Ok(CachedStep {
        step: step as usize,
        epoch: epoch as usize,
        batch: batch as usize,
        experiences: serde_json::from_str(&json).context("Corrupt experience cache entry")?,
    })
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

const COLUMNS: &str = "id, exp_id, epoch, batch, step, dataset, problem_index, dup_index, \
    question, answer, context, prompt, transcript, final_text, reward, critique, stage, \
    created_at, updated_at";

struct RawRollout {
    id: i64,
    exp_id: String,
    epoch: i64,
    batch: i64,
    step: i64,
    dataset: String,
    problem_index: i64,
    dup_index: i64,
    question: String,
    answer: Option<String>,
    context: Option<String>,
    prompt: Option<String>,
    transcript: String,
    final_text: Option<String>,
    reward: Option<f64>,
    critique: Option<String>,
    stage: String,
    created_at: String,
    updated_at: String,
}

impl RawRollout {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            exp_id: row.get(1)?,
            epoch: row.get(2)?,
            batch: row.get(3)?,
            step: row.get(4)?,
            dataset: row.get(5)?,
            problem_index: row.get(6)?,
            dup_index: row.get(7)?,
            question: row.get(8)?,
            answer: row.get(9)?,
            context: row.get(10)?,
            prompt: row.get(11)?,
            transcript: row.get(12)?,
            final_text: row.get(13)?,
            reward: row.get(14)?,
            critique: row.get(15)?,
            stage: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_rollout(self) -> Result<Rollout> {
        Ok(Rollout {
            id: self.id,
            exp_id: self.exp_id,
            epoch: self.epoch as usize,
            batch: self.batch as usize,
            step: self.step as usize,
            dataset: self.dataset,
            problem_index: self.problem_index as usize,
            dup_index: self.dup_index as usize,
            question: self.question,
            answer: self.answer,
            context: self.context,
            prompt: self.prompt,
            transcript: serde_json::from_str(&self.transcript)
                .with_context(|| format!("Corrupt transcript on rollout {}", self.id))?,
            final_text: self.final_text,
            reward: self.reward,
            critique: self.critique,
            stage: self.stage.parse()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{s}'"))?
        .with_timezone(&Utc))
}
