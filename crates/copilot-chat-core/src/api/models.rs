//! Per-model token limits reported by the backend's models endpoint.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 8_192;
const DEFAULT_PROMPT_TOKENS: usize = 8_192;
const DEFAULT_OUTPUT_TOKENS: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    #[serde(default = "default_context_window")]
    pub max_context_window_tokens: usize,
    #[serde(default = "default_prompt")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_output")]
    pub max_output_tokens: usize,
}

fn default_context_window() -> usize {
    DEFAULT_CONTEXT_WINDOW_TOKENS
}

fn default_prompt() -> usize {
    DEFAULT_PROMPT_TOKENS
}

fn default_output() -> usize {
    DEFAULT_OUTPUT_TOKENS
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    capabilities: Option<Capabilities>,
}

#[derive(Debug, Deserialize)]
struct Capabilities {
    limits: Option<ModelLimits>,
}

/// Known model limits, keyed by model id and its dot/hyphen spellings.
///
/// Clones share the same catalog.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    limits: Arc<RwLock<HashMap<String, ModelLimits>>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_id: &str) -> Option<ModelLimits> {
        self.read().get(model_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All entries, aliases included, sorted by id.
    pub fn entries(&self) -> Vec<(String, ModelLimits)> {
        let mut entries: Vec<_> = self
            .read()
            .iter()
            .map(|(id, limits)| (id.clone(), *limits))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Record limits from a models-endpoint response (`{"data": [...]}` or a
    /// bare list). Entries without limits are skipped. Returns the number of
    /// models recorded; an unrecognised document records nothing.
    pub fn ingest(&self, body: &Value) -> usize {
        let list = match body {
            Value::Object(map) => map.get("data").cloned(),
            Value::Array(_) => Some(body.clone()),
            _ => None,
        };
        let entries: Vec<ModelEntry> = match list.map(serde_json::from_value) {
            Some(Ok(entries)) => entries,
            Some(Err(e)) => {
                warn!(error = %e, "Unexpected models response format");
                return 0;
            }
            None => {
                warn!("Models response has no model list");
                return 0;
            }
        };
        debug!(count = entries.len(), "Models endpoint returned entries");

        let models: Vec<(String, ModelLimits)> = entries
            .into_iter()
            .filter(|entry| !entry.id.is_empty())
            .filter_map(|entry| Some((entry.id, entry.capabilities?.limits?)))
            .collect();

        let mut limits = self.write();
        // Aliases are overwritten on every refresh; canonical ids go in last
        // so a listed id always beats another model's alias.
        for (id, lim) in &models {
            for alias in aliases(id) {
                limits.insert(alias, *lim);
            }
        }
        for (id, lim) in &models {
            info!(
                model = %id,
                context = lim.max_context_window_tokens,
                prompt = lim.max_prompt_tokens,
                output = lim.max_output_tokens,
                "Model limits"
            );
            limits.insert(id.clone(), *lim);
        }
        models.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModelLimits>> {
        self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ModelLimits>> {
        self.limits.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Alternate spellings of a model id: dots and hyphens swapped, plus each
/// version split point re-joined with dots (`claude-opus-4-5` ->
/// `claude-opus-4.5`).
fn aliases(model_id: &str) -> Vec<String> {
    let mut out = Vec::new();
    for alt in [model_id.replace('.', "-"), model_id.replace('-', ".")] {
        if alt != model_id && !out.contains(&alt) {
            out.push(alt);
        }
    }

    let normalized = model_id.replace('.', "-");
    let parts: Vec<&str> = normalized.split('-').collect();
    for i in 1..parts.len() {
        if parts[i].starts_with(|c: char| c.is_ascii_digit()) {
            let variant = format!("{}.{}", parts[..i].join("-"), parts[i..].join("."));
            if variant != model_id && !out.contains(&variant) {
                out.push(variant);
            }
        }
    }
    out
}
