//! Concrete model loading: GGUF weights through llama.cpp, fetched from the
//! HuggingFace Hub via the embedded registry or read from local files.

pub mod hf_download;
pub mod llamacpp;
pub mod registry;

use std::path::PathBuf;

use tracing::info;

pub use hf_download::{download_file, fetch, get_tokenizer_path, get_variant_path};
pub use llamacpp::LlamaCppModel;
pub use registry::{ModelFamily, ModelRegistry, VariantConfig, registry};

use crate::config::{Config, TokenizerConfig};
use crate::error::{PredictError, Result};
use crate::tokenizer::HfTokenizer;

/// Local weight and tokenizer files for a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub gguf: PathBuf,
    pub tokenizer_json: PathBuf,
}

impl ModelFiles {
    /// Use the direct paths of the configuration, or download the registry
    /// variant matching its family and precision.
    pub fn resolve(config: &Config) -> Result<Self> {
        let settings = &config.model;
        if let Some(gguf) = &settings.gguf {
            let tokenizer_json = settings.tokenizer_json.clone().ok_or_else(|| {
                PredictError::config("model.tokenizer_json is required when model.gguf is set")
            })?;
            return Ok(Self {
                gguf: gguf.clone(),
                tokenizer_json,
            });
        }
        let family = settings
            .family
            .as_deref()
            .ok_or_else(|| PredictError::config("either model.family or model.gguf must be set"))?;
        let (gguf, registry_tokenizer) = fetch(family, settings.precision)?;
        Ok(Self {
            gguf,
            tokenizer_json: settings.tokenizer_json.clone().unwrap_or(registry_tokenizer),
        })
    }
}

/// Tokenizer options with the reported name filled in.
///
/// Registry downloads are named after their family. A direct GGUF keeps the
/// name unset so it is taken from the tokenizer file's directory.
fn tokenizer_settings(config: &Config) -> TokenizerConfig {
    let mut settings = config.tokenizer.clone();
    if settings.name.is_none() && config.model.gguf.is_none() {
        settings.name = config.model.family.clone();
    }
    settings
}

/// Load the llama.cpp model and its tokenizer for a configuration.
pub fn load(config: &Config) -> Result<(LlamaCppModel, HfTokenizer)> {
    let files = ModelFiles::resolve(config)?;
    info!("Loading model from {:?}", files.gguf);

    let tokenizer = HfTokenizer::from_file(&files.tokenizer_json, &tokenizer_settings(config))?;
    let model = LlamaCppModel::from_file(&files.gguf, config.model_name(), &config.model)?;
    Ok((model, tokenizer))
}
