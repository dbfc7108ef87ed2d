//! Parameter overrides applied to a stage's template copy.
//!
//! Templates are `key = value` files. An override replaces the whole line of
//! a matching key; `-` and `_` are interchangeable in keys, as the engine
//! treats them. Keys absent from the template are reported back so the
//! caller can warn about them; they are never appended.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered `key -> value` overrides for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterOverrides(BTreeMap<String, serde_json::Value>);

/// Result of applying overrides to template text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOverrides {
    /// The rewritten template.
    pub content: String,
    /// Override keys that matched no line.
    pub unmatched: Vec<String>,
}

fn normalize_key(key: &str) -> String {
    key.trim().replace('-', "_").to_ascii_lowercase()
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(" "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl ParameterOverrides {
    /// Creates an empty set of overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an override.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds or replaces an override in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns true if there are no overrides.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of overrides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over overrides in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Merges `other` over `self`; keys in `other` win.
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    /// Rewrites matching `key = value` lines of `template`.
    #[must_use]
    pub fn apply(&self, template: &str) -> AppliedOverrides {
        let wanted: BTreeMap<String, (&String, String)> = self
            .0
            .iter()
            .map(|(k, v)| (normalize_key(k), (k, render_value(v))))
            .collect();
        let mut matched = std::collections::BTreeSet::new();

        let mut content = String::with_capacity(template.len());
        for line in template.split_inclusive('\n') {
            let replacement = line
                .split_once('=')
                .map(|(key, _)| key)
                .filter(|key| !key.trim_start().starts_with(';'))
                .and_then(|key| {
                    let normalized = normalize_key(key);
                    wanted
                        .get(&normalized)
                        .map(|(_, value)| (normalized, key.trim().to_string(), value))
                });

            match replacement {
                Some((normalized, key, value)) => {
                    content.push_str(&format!("{key} = {value}\n"));
                    matched.insert(normalized);
                }
                None => content.push_str(line),
            }
        }

        let unmatched = wanted
            .iter()
            .filter(|(normalized, _)| !matched.contains(*normalized))
            .map(|(_, (original, _))| (*original).clone())
            .collect();

        AppliedOverrides { content, unmatched }
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for ParameterOverrides {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
