//! Prometheus relabel rules
//!
//! [`RelabelConfig`] is the wire form used in ScrapeConfig objects.
//! [`apply`] evaluates a rule sequence against a target's label set with
//! Prometheus semantics (fully anchored regex over `;`-joined source values,
//! `$1`-style replacement expansion) for the actions the scrape job uses.

use std::collections::BTreeMap;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REGEX: &str = "(.*)";
const DEFAULT_REPLACEMENT: &str = "$1";

/// Relabel evaluation errors
#[derive(Debug, Error)]
pub enum RelabelError {
    /// Rule regex does not compile
    #[error("invalid relabel regex '{regex}': {source}")]
    InvalidRegex {
        /// The offending pattern
        regex: String,
        /// Compilation failure
        #[source]
        source: regex::Error,
    },

    /// Rule action this evaluator does not implement
    #[error("unsupported relabel action '{0}'")]
    UnsupportedAction(String),
}

/// A single relabel rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelabelConfig {
    /// Labels whose values are joined and matched against `regex`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_labels: Vec<String>,
    /// Separator used when joining source values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    /// Label written by `replace`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    /// Pattern matched against the joined source values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Replacement template, may reference capture groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// replace, keep, drop or labelmap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl RelabelConfig {
    /// `replace` that sets `target` to a fixed value
    pub fn set(target: &str, value: &str) -> Self {
        Self {
            target_label: Some(target.to_string()),
            replacement: Some(value.to_string()),
            action: Some("replace".to_string()),
            ..Default::default()
        }
    }

    /// `keep` that drops targets whose joined `sources` do not match `regex`
    pub fn keep(sources: &[&str], regex: &str) -> Self {
        Self {
            source_labels: sources.iter().map(|s| s.to_string()).collect(),
            regex: Some(regex.to_string()),
            action: Some("keep".to_string()),
            ..Default::default()
        }
    }

    /// `labelmap` copying labels whose name matches `regex`
    pub fn labelmap(regex: &str) -> Self {
        Self {
            regex: Some(regex.to_string()),
            action: Some("labelmap".to_string()),
            ..Default::default()
        }
    }

    /// `replace` that writes the expanded `replacement` into `target` when
    /// the joined `sources` match `regex`
    pub fn replace(sources: &[&str], regex: &str, target: &str, replacement: &str) -> Self {
        Self {
            source_labels: sources.iter().map(|s| s.to_string()).collect(),
            target_label: Some(target.to_string()),
            regex: Some(regex.to_string()),
            replacement: Some(replacement.to_string()),
            action: Some("replace".to_string()),
            ..Default::default()
        }
    }

    /// Metric relabeling that keeps only series whose name matches one of `names`
    pub fn keep_metrics(names: &[&str]) -> Self {
        Self::keep(&["__name__"], &format!("^({})$", names.join("|")))
    }

    fn compiled_regex(&self) -> Result<Regex, RelabelError> {
        let pattern = self.regex.as_deref().unwrap_or(DEFAULT_REGEX);
        Regex::new(&format!("^(?:{pattern})$")).map_err(|source| RelabelError::InvalidRegex {
            regex: pattern.to_string(),
            source,
        })
    }

    fn joined_source(&self, labels: &BTreeMap<String, String>) -> String {
        let separator = self.separator.as_deref().unwrap_or(DEFAULT_SEPARATOR);
        self.source_labels
            .iter()
            .map(|l| labels.get(l).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Apply this rule in place; returns false when the target is dropped
    pub fn apply(&self, labels: &mut BTreeMap<String, String>) -> Result<bool, RelabelError> {
        let regex = self.compiled_regex()?;
        let replacement = self.replacement.as_deref().unwrap_or(DEFAULT_REPLACEMENT);

        match self.action.as_deref().unwrap_or("replace") {
            "keep" => Ok(regex.is_match(&self.joined_source(labels))),
            "drop" => Ok(!regex.is_match(&self.joined_source(labels))),
            "replace" => {
                let source = self.joined_source(labels);
                if let (Some(target), Some(caps)) =
                    (self.target_label.as_deref(), regex.captures(&source))
                {
                    let mut value = String::new();
                    caps.expand(replacement, &mut value);
                    if value.is_empty() {
                        labels.remove(target);
                    } else {
                        labels.insert(target.to_string(), value);
                    }
                }
                Ok(true)
            }
            "labelmap" => {
                let mapped: Vec<(String, String)> = labels
                    .iter()
                    .filter_map(|(name, value)| {
                        regex.captures(name).map(|caps| {
                            let mut new_name = String::new();
                            caps.expand(replacement, &mut new_name);
                            (new_name, value.clone())
                        })
                    })
                    .collect();
                labels.extend(mapped);
                Ok(true)
            }
            other => Err(RelabelError::UnsupportedAction(other.to_string())),
        }
    }
}

/// Run `rules` in order over `labels`; `None` when a rule drops the target
pub fn apply(
    rules: &[RelabelConfig],
    mut labels: BTreeMap<String, String>,
) -> Result<Option<BTreeMap<String, String>>, RelabelError> {
    for rule in rules {
        if !rule.apply(&mut labels)? {
            return Ok(None);
        }
    }
    Ok(Some(labels))
}
