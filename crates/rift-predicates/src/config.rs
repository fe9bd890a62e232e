//! Engine configuration.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Files may be YAML or JSON (JSON is parsed by the YAML loader as well).

use crate::error::{PredicateError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Allow `inject` predicates (Mountebank's `--allowInjection`)
    #[serde(default)]
    pub allow_injection: bool,

    #[serde(default)]
    pub injection: InjectionLimits,

    #[serde(default)]
    pub regex: RegexConfig,
}

/// Capability budget for injected scripts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InjectionLimits {
    /// Maximum number of script operations before the run is aborted
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    /// Maximum function call nesting
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    /// Maximum length of any string built by a script, in bytes
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    /// Compiled scripts kept in memory; least recently used are evicted
    #[serde(default = "default_max_cached_scripts")]
    pub max_cached_scripts: usize,
}

fn default_max_operations() -> u64 {
    100_000
}

fn default_max_call_levels() -> usize {
    32
}

fn default_max_string_size() -> usize {
    1024 * 1024
}

fn default_max_cached_scripts() -> usize {
    1024
}

impl Default for InjectionLimits {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_cached_scripts: default_max_cached_scripts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegexConfig {
    /// Compiled program size limit for `matches` and `except` patterns
    #[serde(default = "default_regex_size_limit")]
    pub size_limit: usize,
}

fn default_regex_size_limit() -> usize {
    1 << 20
}

impl Default for RegexConfig {
    fn default() -> Self {
        Self {
            size_limit: default_regex_size_limit(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration document (YAML or JSON).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| PredicateError::Config(e.to_string()))
    }

    /// Load a configuration file (YAML or JSON).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PredicateError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    /// Builder-style toggle for injection.
    pub fn with_injection(mut self, allow: bool) -> Self {
        self.allow_injection = allow;
        self
    }
}
