//! Agent configuration materialization.
//!
//! The learned experience text is appended to the instructions of a YAML
//! agent configuration. Everything else in the document is kept as-is.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_yaml::{Mapping, Value};
use tracing::info;

/// Header placed in front of the appended experience block.
pub const EXPERIENCE_HEADER: &str = "When solving problems, use these experiences learned from practice:";

const DEFAULT_AGENT_NAME: &str = "tfgrpo-agent";

/// Read `template` (or start from a minimal agent document), append
/// `experiences_text` to its instructions, and write YAML to `output`.
///
/// The instructions field is `agent.instructions` when the document has an
/// `agent` mapping, otherwise the top-level `instructions`.
pub fn materialize_agent_config(template: Option<&Path>, experiences_text: &str, output: &Path) -> Result<()> {
    let mut doc = match template {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read agent template {}", path.display()))?;
            serde_yaml::from_str::<Value>(&text)
                .with_context(|| format!("Failed to parse agent template {}", path.display()))?
        }
        None => default_document(),
    };

    append_experiences(&mut doc, experiences_text)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let yaml = serde_yaml::to_string(&doc).context("Failed to serialize agent config")?;
    std::fs::write(output, yaml).with_context(|| format!("Failed to write agent config to {}", output.display()))?;
    info!(path = %output.display(), chars = experiences_text.len(), "Wrote agent configuration");
    Ok(())
}

fn default_document() -> Value {
    let mut agent = Mapping::new();
    agent.insert("name".into(), DEFAULT_AGENT_NAME.into());
    agent.insert("instructions".into(), "".into());
    let mut root = Mapping::new();
    root.insert("agent".into(), Value::Mapping(agent));
    Value::Mapping(root)
}

/// Append the experience block to the document's instructions in place.
pub fn append_experiences(doc: &mut Value, experiences_text: &str) -> Result<()> {
    let Value::Mapping(root) = doc else {
        bail!("agent configuration must be a YAML mapping");
    };
    let nested = matches!(root.get("agent"), Some(Value::Mapping(_)));
    let target: &mut Mapping = if nested {
        root.get_mut("agent")
            .and_then(Value::as_mapping_mut)
            .context("agent section is not a mapping")?
    } else {
        root
    };
    let current = match target.get("instructions") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(_) => bail!("instructions field is not a string"),
    };
    target.insert("instructions".into(), Value::String(with_experiences(&current, experiences_text)));
    Ok(())
}

fn with_experiences(instructions: &str, experiences_text: &str) -> String {
    if experiences_text.trim().is_empty() {
        return instructions.to_string();
    }
    let block = format!("{EXPERIENCE_HEADER}\n{experiences_text}");
    if instructions.trim().is_empty() {
        block
    } else {
        format!("{}\n\n{block}", instructions.trim_end())
    }
}
