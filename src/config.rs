//! Server configuration
//!
//! Loaded from a TOML file, then overridden by environment variables.
//! Every field has a default so an empty file is a valid configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decoder::{DecoderDescriptor, DecoderId, NEURONS_SET};
use crate::error::SteerError;

/// One configured set of trained decoders (one decoder per listed layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderSetConfig {
    /// Source-set name, e.g. `"res-jb"`
    pub name: String,
    /// Layers that have a decoder in this set
    pub layers: Vec<usize>,
    /// Hook point template; `{layer}` is substituted
    #[serde(default = "default_hook_template")]
    pub hook_template: String,
    /// Catalog ref template understood by the weight source; `{layer}` is substituted
    #[serde(default)]
    pub location_template: String,
}

fn default_hook_template() -> String {
    "blocks.{layer}.hook_resid_post".to_string()
}

impl DecoderSetConfig {
    /// Catalog descriptors for every layer of the set.
    pub fn descriptors(&self) -> Vec<DecoderDescriptor> {
        self.layers
            .iter()
            .map(|&layer| {
                let layer_str = layer.to_string();
                DecoderDescriptor::trained(
                    DecoderId::new(layer, self.name.clone()),
                    self.hook_template.replace("{layer}", &layer_str),
                    self.location_template.replace("{layer}", &layer_str),
                )
            })
            .collect()
    }
}

/// Names of the special tokens used for chat steering masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialTokenNames {
    pub bos: String,
    pub start_of_turn: String,
    pub end_of_turn: String,
}

impl Default for SpecialTokenNames {
    fn default() -> Self {
        Self {
            bos: "<bos>".to_string(),
            start_of_turn: "<start_of_turn>".to_string(),
            end_of_turn: "<end_of_turn>".to_string(),
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Model identifier; selects the engine shape at startup
    pub model_id: String,
    /// Maximum prompt length in tokens
    pub token_limit: usize,
    /// Maximum number of resident trained decoders
    pub max_loaded_decoders: usize,
    /// Maximum number of cached forward passes
    pub activation_cache_entries: usize,
    /// Tokens per streamed chunk for plain-text steering
    pub tokens_per_yield: usize,
    /// Tokens per streamed chunk for chat steering
    pub chat_tokens_per_yield: usize,
    /// Configured decoder sets
    pub decoder_sets: Vec<DecoderSetConfig>,
    /// Keep only decoder ids containing one of these substrings (empty = keep all)
    pub include_decoders: Vec<String>,
    /// Drop decoder ids containing one of these substrings
    pub exclude_decoders: Vec<String>,
    pub special_tokens: SpecialTokenNames,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_id: "reference-tiny".to_string(),
            token_limit: 200,
            max_loaded_decoders: 300,
            activation_cache_entries: 5,
            tokens_per_yield: 1,
            chat_tokens_per_yield: 2,
            decoder_sets: Vec::new(),
            include_decoders: Vec::new(),
            exclude_decoders: Vec::new(),
            special_tokens: SpecialTokenNames::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: ServerConfig = toml::from_str(&text)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        info!(
            "Config: model={}, token_limit={}, max_loaded_decoders={}, cache_entries={}, sets={}",
            config.model_id,
            config.token_limit,
            config.max_loaded_decoders,
            config.activation_cache_entries,
            config.decoder_sets.len()
        );
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("MODEL_ID") {
            self.model_id = value;
        }
        if let Some(v) = lookup("TOKEN_LIMIT").and_then(|v| v.parse().ok()) {
            self.token_limit = v;
        }
        if let Some(v) = lookup("MAX_LOADED_DECODERS").and_then(|v| v.parse().ok()) {
            self.max_loaded_decoders = v;
        }
        if let Some(v) = lookup("ACTIVATION_CACHE_ENTRIES").and_then(|v| v.parse().ok()) {
            self.activation_cache_entries = v;
        }
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.token_limit > 0, "token_limit must be positive");
        anyhow::ensure!(self.max_loaded_decoders > 0, "max_loaded_decoders must be positive");
        anyhow::ensure!(
            self.activation_cache_entries > 0,
            "activation_cache_entries must be positive"
        );
        anyhow::ensure!(
            self.tokens_per_yield > 0 && self.chat_tokens_per_yield > 0,
            "tokens per yield must be positive"
        );
        anyhow::ensure!(!self.model_id.trim().is_empty(), "model_id must not be empty");
        for set in &self.decoder_sets {
            anyhow::ensure!(
                !set.name.is_empty() && !set.name.contains(char::is_whitespace),
                "Decoder set name '{}' is invalid",
                set.name
            );
            // Raw-neuron ids are "{layer}-neurons" internally
            if set.name == NEURONS_SET {
                return Err(SteerError::InvalidRequest(format!(
                    "decoder set name '{NEURONS_SET}' is reserved for raw neurons"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Whether a decoder id passes the include/exclude filters.
    pub fn decoder_allowed(&self, id: &DecoderId) -> bool {
        let id = id.to_string();
        if !self.include_decoders.is_empty() && !self.include_decoders.iter().any(|p| id.contains(p.as_str())) {
            return false;
        }
        !self.exclude_decoders.iter().any(|p| id.contains(p.as_str()))
    }

    /// Catalog descriptors of all configured, filtered decoders in configuration order.
    pub fn decoder_descriptors(&self) -> Vec<DecoderDescriptor> {
        self.decoder_sets
            .iter()
            .flat_map(DecoderSetConfig::descriptors)
            .filter(|d| self.decoder_allowed(&d.id))
            .collect()
    }
}
