//! Label naming and the per-attribute label set.

use std::collections::HashMap;

use crate::config::AttributeDefinition;

/// Label carrying the attribute name on every series.
pub const NAME_LABEL: &str = "name";

/// Sanitize a user-supplied label key.
///
/// Lowercases the key and collapses each run of whitespace into a single
/// underscore. Idempotent.
pub fn sanitize_label_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len());
    let mut in_whitespace = false;

    for c in key.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                result.push('_');
                in_whitespace = true;
            }
        } else {
            result.extend(c.to_lowercase());
            in_whitespace = false;
        }
    }

    result
}

/// Sanitize a name for use as a Prometheus metric name.
///
/// Characters outside `[a-zA-Z0-9_:]` become underscores, runs of underscores
/// collapse, and a leading digit gets an underscore prefix.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
        last_was_underscore = true;
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == ':' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    result
}

/// Map a sanitized label key onto the Prometheus label name alphabet.
///
/// Characters outside `[a-zA-Z0-9_]` become underscores and a leading digit
/// gets an underscore prefix.
pub fn sanitize_label_name(key: &str) -> String {
    let mut result = String::with_capacity(key.len() + 1);

    if key.is_empty() || key.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
    }

    result.extend(
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }),
    );

    result
}

/// The label name a user-supplied key is exported under.
pub fn label_name(key: &str) -> String {
    sanitize_label_name(&sanitize_label_key(key))
}

/// Static label keys of `attribute` that would overwrite the `name` label.
pub fn reserved_label_keys(attribute: &AttributeDefinition) -> Vec<&str> {
    attribute
        .labels
        .iter()
        .map(|(key, _)| key.as_str())
        .filter(|key| label_name(key) == NAME_LABEL)
        .collect()
}

/// Build the exported metric name: `<prefix>_<name>`, where the logical name
/// is trimmed, whitespace runs become underscores, and it is lowercased.
pub fn build_metric_name(prefix: &str, name: &str) -> String {
    let name = sanitize_metric_name(&sanitize_label_key(name.trim()));
    if prefix.is_empty() {
        name
    } else {
        format!("{}_{}", prefix, name)
    }
}

/// The label values attached to every observation of one attribute.
///
/// Always holds `name` first, followed by the static labels in configuration
/// order, keyed by [`label_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelData {
    pairs: Vec<(String, String)>,
}

impl LabelData {
    /// Build the label set for an attribute.
    ///
    /// A static label mapping to `name` is dropped; see
    /// [`reserved_label_keys`].
    pub fn for_attribute(attribute: &AttributeDefinition) -> Self {
        let mut data = Self {
            pairs: vec![(NAME_LABEL.to_string(), attribute.name.clone())],
        };

        for (key, value) in &attribute.labels {
            let key = label_name(key);
            if key != NAME_LABEL {
                data.insert(key, value.clone());
            }
        }

        data
    }

    /// Insert or replace a label value.
    pub fn insert(&mut self, key: String, value: String) {
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Label keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Label names declared for each logical metric name.
pub type LabelSchemas = HashMap<String, Vec<String>>;

/// Compute the label schema of every metric name across all attributes.
///
/// A metric name shared by several attributes gets the union of their label
/// keys, so every attribute's observations fit the one reporter. Keys keep
/// first-seen order with `name` first.
pub fn plan_label_schemas(attributes: &[AttributeDefinition]) -> LabelSchemas {
    let mut schemas = LabelSchemas::new();

    for attribute in attributes {
        let labels = LabelData::for_attribute(attribute);

        for metric in &attribute.metrics {
            let Some(name) = metric.name.as_deref().filter(|n| !n.trim().is_empty()) else {
                continue;
            };

            let schema = schemas.entry(name.to_string()).or_default();
            for key in labels.keys() {
                if !schema.iter().any(|k| k == key) {
                    schema.push(key.to_string());
                }
            }
        }
    }

    schemas
}
