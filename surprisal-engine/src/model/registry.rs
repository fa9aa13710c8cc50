//! TOML-based model registry
//!
//! All downloadable GGUF models are listed in `models.toml` at the crate
//! root. Variants are keyed by the GGUF variant name a [`Precision`] maps to.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::Deserialize;

use crate::config::Precision;
use crate::error::{PredictError, Result};

/// Top-level config parsed from `models.toml`
#[derive(Debug, Deserialize)]
pub struct ModelRegistry {
    /// Default family name (e.g. "gpt2")
    pub default_model: String,
    pub models: BTreeMap<String, ModelFamily>,
}

/// A model family: one HuggingFace repo, several quantisation variants
#[derive(Debug, Deserialize)]
pub struct ModelFamily {
    pub repo_id: String,
    /// Repo holding `tokenizer.json`, when the GGUF repo has none
    #[serde(default)]
    pub tokenizer_repo: Option<String>,
    pub display_name: String,
    /// Context window the weights were trained with
    #[serde(default)]
    pub n_ctx: Option<u32>,
    /// Variants keyed by precision name (e.g. "q8_0", "f16")
    pub variants: BTreeMap<String, VariantConfig>,
}

/// A single downloadable GGUF file
#[derive(Debug, Deserialize)]
pub struct VariantConfig {
    /// GGUF filename in the HuggingFace repo
    pub filename: String,
    pub display_name: String,
}

impl ModelFamily {
    pub fn tokenizer_repo(&self) -> &str {
        self.tokenizer_repo.as_deref().unwrap_or(&self.repo_id)
    }
}

static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();

/// Return the global model registry, parsed once from the embedded `models.toml`.
pub fn registry() -> &'static ModelRegistry {
    REGISTRY.get_or_init(|| {
        let toml_str = include_str!("../../models.toml");
        toml::from_str(toml_str).expect("Failed to parse models.toml")
    })
}

impl ModelRegistry {
    pub fn family(&self, name: &str) -> Option<&ModelFamily> {
        self.models.get(name)
    }

    /// Look up the variant of `family` matching `precision`.
    pub fn resolve(
        &self,
        family: &str,
        precision: Precision,
    ) -> Result<(&ModelFamily, &VariantConfig)> {
        let key = precision.loader_params().gguf_variant;
        let model = self
            .family(family)
            .ok_or_else(|| PredictError::UnknownVariant(family.to_string()))?;
        let variant = model
            .variants
            .get(key)
            .ok_or_else(|| PredictError::UnknownVariant(format!("{}-{}", family, key)))?;
        Ok((model, variant))
    }

    /// Iterate over all `(family name, family, variant key, variant)` entries.
    pub fn iter_variants(
        &self,
    ) -> impl Iterator<Item = (&str, &ModelFamily, &str, &VariantConfig)> {
        self.models.iter().flat_map(|(name, family)| {
            family
                .variants
                .iter()
                .map(move |(key, variant)| (name.as_str(), family, key.as_str(), variant))
        })
    }
}
