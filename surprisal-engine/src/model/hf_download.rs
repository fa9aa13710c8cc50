//! HuggingFace model download utilities
//!
//! Files are cached in the HuggingFace cache directory
//! (`~/.cache/huggingface/hub/`).

use std::path::PathBuf;

use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};

use super::registry::{ModelFamily, VariantConfig, registry};
use crate::config::Precision;
use crate::error::{PredictError, Result};

/// Download one file from a HuggingFace model repo and return its local path.
///
/// # Environment Variables
/// * `HF_TOKEN` - HuggingFace API token (required for private repositories)
pub fn download_file(repo_id: &str, filename: &str) -> Result<PathBuf> {
    let mut builder = ApiBuilder::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder
        .build()
        .map_err(|e| PredictError::Download(e.into()))?;

    let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

    tracing::info!("Downloading {} from {}...", filename, repo_id);

    let path = repo
        .get(filename)
        .map_err(|e| PredictError::Download(e.into()))?;

    tracing::info!("Downloaded to {:?}", path);

    Ok(path)
}

pub fn get_variant_path(family: &ModelFamily, variant: &VariantConfig) -> Result<PathBuf> {
    download_file(&family.repo_id, &variant.filename)
}

/// Local path to the family's `tokenizer.json`, downloading if necessary.
pub fn get_tokenizer_path(family: &ModelFamily) -> Result<PathBuf> {
    download_file(family.tokenizer_repo(), "tokenizer.json")
}

/// Resolve a family and precision in the global registry and fetch both the
/// GGUF weights and the tokenizer.
pub fn fetch(family: &str, precision: Precision) -> Result<(PathBuf, PathBuf)> {
    let (family, variant) = registry().resolve(family, precision)?;
    Ok((get_variant_path(family, variant)?, get_tokenizer_path(family)?))
}
