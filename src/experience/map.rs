//! The flat experience map and its edit operations.
//!
//! An [`ExperienceMap`] is an ordered mapping from [`ExperienceId`] (`G0`,
//! `G1`, ...) to a natural-language lesson. Edits arrive as [`Operation`]s
//! produced by the LLM and are applied with these contracts:
//!
//! - `ADD` appends under a fresh id (one past the largest id in use).
//! - `UPDATE` on a present id replaces its content; on an absent id it is an `ADD`.
//! - `DELETE` on a present id removes it; on an absent id it does nothing.
//!
//! After each update cycle the map is [renumbered](ExperienceMap::renumbered)
//! densely from `G0`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// ExperienceId
// ---------------------------------------------------------------------------

/// Identifier of one flat experience, rendered as `G<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExperienceId(pub u32);

impl fmt::Display for ExperienceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

impl FromStr for ExperienceId {
    type Err = anyhow::Error;

    /// Accepts `G3`, `g3`, `[G3]` and plain `3`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']').trim();
        let digits = trimmed
            .strip_prefix('G')
            .or_else(|| trimmed.strip_prefix('g'))
            .unwrap_or(trimmed);
        let n = digits
            .parse::<u32>()
            .with_context(|| format!("invalid experience id '{s}'"))?;
        Ok(ExperienceId(n))
    }
}

impl Serialize for ExperienceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExperienceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Operation kind as emitted by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    Add,
    Update,
    Delete,
    /// Explicit no-op; some models emit it for candidates already covered.
    #[serde(rename = "NONE")]
    Noop,
}

/// One edit to the experience map, in the JSON shape the model emits:
/// `{"operation": "UPDATE", "id": "G3", "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_id")]
    pub id: Option<ExperienceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Operation {
    pub fn add(content: impl Into<String>) -> Self {
        Self {
            operation: OpKind::Add,
            id: None,
            content: Some(content.into()),
        }
    }

    pub fn update(id: ExperienceId, content: impl Into<String>) -> Self {
        Self {
            operation: OpKind::Update,
            id: Some(id),
            content: Some(content.into()),
        }
    }

    pub fn delete(id: ExperienceId) -> Self {
        Self {
            operation: OpKind::Delete,
            id: Some(id),
            content: None,
        }
    }
}

/// Ids may arrive as `"G3"`, `3`, `null` or garbage; garbage becomes `None`.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<ExperienceId>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()).map(ExperienceId),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// ExperienceMap
// ---------------------------------------------------------------------------

/// What [`ExperienceMap::apply`] did with one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Added(ExperienceId),
    Updated(ExperienceId),
    Deleted(ExperienceId),
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperienceMap {
    entries: BTreeMap<ExperienceId, String>,
}

impl ExperienceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: ExperienceId) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: ExperienceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExperienceId, &str)> {
        self.entries.iter().map(|(id, text)| (*id, text.as_str()))
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    /// Next unused id: one past the largest id in use.
    pub fn next_id(&self) -> ExperienceId {
        self.entries
            .keys()
            .next_back()
            .map(|id| ExperienceId(id.0 + 1))
            .unwrap_or(ExperienceId(0))
    }

    /// Append `content` under a fresh id.
    pub fn add(&mut self, content: impl Into<String>) -> ExperienceId {
        let id = self.next_id();
        self.entries.insert(id, content.into());
        id
    }

    /// Replace the content at `id`; falls back to [`add`](Self::add) when
    /// `id` is absent.
    pub fn replace(&mut self, id: ExperienceId, content: impl Into<String>) -> Applied {
        if let Some(slot) = self.entries.get_mut(&id) {
            *slot = content.into();
            return Applied::Updated(id);
        }
        Applied::Added(self.add(content))
    }

    /// Remove `id` if present.
    pub fn remove(&mut self, id: ExperienceId) -> Option<String> {
        self.entries.remove(&id)
    }

    /// Apply one operation. Operations missing the content they need are
    /// skipped.
    pub fn apply(&mut self, op: &Operation) -> Applied {
        let content = op.content.as_deref().map(str::trim).filter(|c| !c.is_empty());
        match (op.operation, op.id, content) {
            (OpKind::Add, _, Some(content)) => Applied::Added(self.add(content)),
            (OpKind::Update, Some(id), Some(content)) => self.replace(id, content),
            (OpKind::Update, None, Some(content)) => Applied::Added(self.add(content)),
            (OpKind::Delete, Some(id), _) => match self.remove(id) {
                Some(_) => Applied::Deleted(id),
                None => Applied::Skipped,
            },
            _ => Applied::Skipped,
        }
    }

    /// Apply a whole revision plan in order.
    pub fn apply_all(&mut self, ops: &[Operation]) -> Vec<Applied> {
        ops.iter().map(|op| self.apply(op)).collect()
    }

    /// Copy with ids reassigned densely (`G0, G1, ...`) in current order.
    pub fn renumbered(&self) -> Self {
        Self {
            entries: self
                .entries
                .values()
                .enumerate()
                .map(|(i, text)| (ExperienceId(i as u32), text.clone()))
                .collect(),
        }
    }

    /// Render as an enumerated list, one `[G<n>]. lesson` per line.
    pub fn format_enumerated(&self) -> String {
        self.entries
            .iter()
            .map(|(id, text)| format!("[{id}]. {text}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FromIterator<String> for ExperienceMap {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut map = ExperienceMap::new();
        for text in iter {
            map.add(text);
        }
        map
    }
}

/// Parse a JSON list of operations out of free model text.
///
/// A fenced code block is tried first, then the whole response. Within each,
/// the first `[` that starts a decodable operation list wins, so bracketed
/// ids such as `[G1]` in surrounding prose are skipped.
pub fn parse_operations(response: &str) -> Result<Vec<Operation>> {
    fenced_block(response)
        .into_iter()
        .chain([response])
        .find_map(first_operation_list)
        .with_context(|| format!("no JSON operation list found in response: {}", response.trim()))
}

fn first_operation_list(text: &str) -> Option<Vec<Operation>> {
    text.match_indices('[').find_map(|(i, _)| {
        serde_json::Deserializer::from_str(&text[i..])
            .into_iter::<Vec<Operation>>()
            .next()
            .and_then(|parsed| parsed.ok())
    })
}

/// Contents of the first markdown code fence, without its language tag.
fn fenced_block(s: &str) -> Option<&str> {
    let (_, after) = s.split_once("```")?;
    let (_, body) = after.split_once('\n')?;
    let (inner, _) = body.split_once("```")?;
    Some(inner)
}
