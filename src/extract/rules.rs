use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_LINK_LIMIT: usize = 10;

/// What to pull out of a loaded page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionRules {
    /// Article links; the first selector producing any link wins.
    Links {
        #[serde(default)]
        selectors: Vec<String>,
        #[serde(default = "default_link_limit")]
        limit: usize,
        #[serde(default = "default_true")]
        site_defaults: bool,
    },
    Fields { fields: Vec<FieldRule> },
    /// Full document HTML with the listed elements removed.
    Html {
        #[serde(default = "default_strip")]
        strip: Vec<String>,
    },
    Reader,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        ExtractionRules::Links {
            selectors: Vec::new(),
            limit: DEFAULT_LINK_LIMIT,
            site_defaults: true,
        }
    }
}

impl ExtractionRules {
    pub fn html() -> Self {
        ExtractionRules::Html {
            strip: default_strip(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub source: FieldSource,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldSource {
    #[default]
    Text,
    Html,
    Attribute { name: String },
}

/// When a page counts as loaded enough to extract from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadyCondition {
    Load,
    #[default]
    DomContentLoaded,
    NetworkIdle {
        #[serde(default = "default_quiet_ms")]
        quiet_ms: u64,
    },
    Selector { selector: String },
}

impl fmt::Display for ReadyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyCondition::Load => f.write_str("load"),
            ReadyCondition::DomContentLoaded => f.write_str("DOMContentLoaded"),
            ReadyCondition::NetworkIdle { quiet_ms } => write!(f, "network idle for {}ms", quiet_ms),
            ReadyCondition::Selector { selector } => write!(f, "selector `{}`", selector),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub title: String,
    pub url: String,
}

fn default_link_limit() -> usize {
    DEFAULT_LINK_LIMIT
}

fn default_true() -> bool {
    true
}

fn default_strip() -> Vec<String> {
    ["script", "iframe", "noscript"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_quiet_ms() -> u64 {
    500
}
