//! Scoring configuration
//!
//! Every recognised option is a typed field; defaults live in the embedded
//! `config/default.toml` and a user file is merged on top of it before
//! validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PredictError, Result};
use crate::text::Normalization;

/// Default configuration TOML embedded from config/default.toml
const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

/// Where model weights run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePolicy {
    /// Offload to the GPU when the backend supports it, otherwise CPU
    #[default]
    Best,
    Cpu,
    Gpu,
}

/// Numeric precision of the loaded weights.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Full,
    Half,
    Int8,
    Int4,
}

/// Weight element type requested from the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
}

/// Loader parameters derived from a [`Precision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderParams {
    pub dtype: DType,
    /// Weight quantisation width, if quantised
    pub quantization_bits: Option<u8>,
    pub low_cpu_mem_usage: bool,
    /// Key of the matching variant in a `models.toml` family
    pub gguf_variant: &'static str,
}

impl Precision {
    pub fn loader_params(self) -> LoaderParams {
        match self {
            Precision::Full => LoaderParams {
                dtype: DType::F32,
                quantization_bits: None,
                low_cpu_mem_usage: false,
                gguf_variant: "f32",
            },
            Precision::Half => LoaderParams {
                dtype: DType::F16,
                quantization_bits: None,
                low_cpu_mem_usage: true,
                gguf_variant: "f16",
            },
            Precision::Int8 => LoaderParams {
                dtype: DType::F16,
                quantization_bits: Some(8),
                low_cpu_mem_usage: true,
                gguf_variant: "q8_0",
            },
            Precision::Int4 => LoaderParams {
                dtype: DType::F16,
                quantization_bits: Some(4),
                low_cpu_mem_usage: true,
                gguf_variant: "q4_k_m",
            },
        }
    }
}

/// Whether weights are used as published or prepared for a new head.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    #[default]
    Pretrained,
    /// Fresh classification head; requires `num_labels`
    Finetune,
}

/// Architecture family, which selects the token predictor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Autoregressive: each token is predicted from its left context
    #[default]
    Causal,
    /// Bidirectional: each token is predicted with itself masked
    Masked,
}

/// Pseudo-log-likelihood variant for masked models.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PllPolicy {
    /// Mask only the target token (Salazar et al., 2020)
    #[default]
    Original,
    /// Also mask the rest of the target's word to its right
    /// (PLL-word-l2r, Kauf & Ivanova, 2023)
    Modified,
}

/// Configuration settings for scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelSettings,
    pub scoring: ScoringSettings,
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub labels: LabelSettings,
}

/// Model selection and loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model family in the registry
    pub family: Option<String>,
    /// Direct GGUF file path (overrides `family`)
    #[serde(default)]
    pub gguf: Option<PathBuf>,
    /// Path to tokenizer.json (required with `gguf`)
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
    /// Name reported in word records (defaults to the family or file stem)
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device: DevicePolicy,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub load_mode: LoadMode,
    /// Number of labels of a classification head
    #[serde(default)]
    pub num_labels: Option<usize>,
    pub n_ctx: u32,
    /// Number of threads for llama.cpp inference (0 = llama.cpp default)
    pub n_threads: u32,
}

/// Scoring conventions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSettings {
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default)]
    pub pll: PllPolicy,
    pub add_special_tokens: bool,
}

/// Tokenizer options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Name reported in word records (defaults to the file stem)
    #[serde(default)]
    pub name: Option<String>,
    /// Unknown token; the one declared by the tokenizer model when unset
    #[serde(default)]
    pub unk_token: Option<String>,
    /// Padding token; taken from the tokenizer's padding params when unset
    #[serde(default)]
    pub pad_token: Option<String>,
    /// Mask token for masked models; `[MASK]` or `<mask>` when unset
    #[serde(default)]
    pub mask_token: Option<String>,
    pub model_max_length: usize,
    #[serde(default)]
    pub normalization: Normalization,
}

/// Raw label maps as written in TOML (keys are strings there)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelSettings {
    #[serde(default)]
    pub id2label: BTreeMap<String, String>,
    #[serde(default)]
    pub label2id: BTreeMap<String, u32>,
}

/// Validated, mutually inverse label maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    pub id2label: BTreeMap<u32, String>,
    pub label2id: BTreeMap<String, u32>,
}

impl LabelMap {
    pub fn is_empty(&self) -> bool {
        self.id2label.is_empty()
    }

    pub fn label(&self, id: u32) -> Option<&str> {
        self.id2label.get(&id).map(String::as_str)
    }
}

impl LabelSettings {
    /// Parse ids and derive `label2id` from `id2label` when it is absent.
    pub fn resolve(&self) -> Result<LabelMap> {
        let mut id2label = BTreeMap::new();
        for (key, label) in &self.id2label {
            let id: u32 = key
                .trim()
                .parse()
                .map_err(|_| PredictError::config(format!("label id '{}' is not an integer", key)))?;
            id2label.insert(id, label.clone());
        }

        if self.label2id.is_empty() {
            let label2id = id2label.iter().map(|(&i, l)| (l.clone(), i)).collect();
            return Ok(LabelMap { id2label, label2id });
        }

        for (label, id) in &self.label2id {
            if id2label.get(id) != Some(label) {
                return Err(PredictError::config(format!(
                    "label2id maps '{}' to {}, which id2label does not invert",
                    label, id
                )));
            }
        }
        if self.label2id.len() != id2label.len() {
            return Err(PredictError::config(
                "id2label and label2id have different sizes",
            ));
        }
        Ok(LabelMap {
            id2label,
            label2id: self.label2id.clone(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must be valid")
    }
}

/// Recursively merge `overlay` TOML values on top of `base`.
fn merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    if let (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) =
        (&mut *base, overlay)
    {
        for (key, value) in overlay_table {
            match base_table.get_mut(key) {
                Some(base_value) => merge_toml(base_value, value),
                None => {
                    base_table.insert(key.clone(), value.clone());
                }
            }
        }
        return;
    }
    *base = overlay.clone();
}

/// Get the project directories for surprisal.
fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "surprisal", "surprisal")
}

impl Config {
    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse user TOML merged on top of the defaults, then validate.
    pub fn from_toml_str(user_content: &str) -> Result<Self> {
        let mut base: toml::Value = toml::from_str(DEFAULT_CONFIG_TOML)
            .map_err(|e| PredictError::config(e.to_string()))?;
        let user: toml::Value =
            toml::from_str(user_content).map_err(|e| PredictError::config(e.to_string()))?;
        merge_toml(&mut base, &user);
        let config: Config = base
            .try_into()
            .map_err(|e: toml::de::Error| PredictError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default configuration file, or the defaults when it
    /// does not exist.
    pub fn load() -> Result<Self> {
        let Some(config_file) = Self::config_file() else {
            debug!("Could not determine config directory, using defaults");
            return Ok(Self::default());
        };
        if !config_file.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&config_file)
    }

    /// Load settings from a specific file, merged on top of defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| {
            PredictError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Save settings to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let io_err = |e: std::io::Error| {
            PredictError::config(format!("cannot write {}: {}", path.display(), e))
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PredictError::config(e.to_string()))?;
        fs::write(path, content).map_err(io_err)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.model.gguf.is_some() && self.model.tokenizer_json.is_none() {
            return Err(PredictError::config(
                "model.tokenizer_json is required when model.gguf is set",
            ));
        }
        if self.model.gguf.is_none() && self.model.family.is_none() {
            return Err(PredictError::config(
                "either model.family or model.gguf must be set",
            ));
        }
        if self.model.n_ctx == 0 {
            return Err(PredictError::config("model.n_ctx must be non-zero"));
        }
        if self.tokenizer.model_max_length == 0 {
            return Err(PredictError::config(
                "tokenizer.model_max_length must be non-zero",
            ));
        }
        match (self.model.load_mode, self.model.num_labels) {
            (LoadMode::Finetune, None) => {
                return Err(PredictError::config(
                    "model.num_labels must be set when load_mode is finetune",
                ));
            }
            (_, Some(0)) => {
                return Err(PredictError::config("model.num_labels must be non-zero"));
            }
            _ => {}
        }
        let labels = self.labels.resolve()?;
        if let Some(n) = self.model.num_labels
            && !labels.is_empty()
            && labels.id2label.len() != n
        {
            return Err(PredictError::config(format!(
                "model.num_labels is {} but id2label has {} entries",
                n,
                labels.id2label.len()
            )));
        }
        Ok(())
    }

    /// Label maps after validation.
    pub fn label_map(&self) -> Result<LabelMap> {
        self.labels.resolve()
    }

    /// Name reported for the model in word records.
    pub fn model_name(&self) -> String {
        if let Some(name) = &self.model.name {
            return name.clone();
        }
        if let Some(stem) = self.model.gguf.as_deref().and_then(file_stem) {
            return stem;
        }
        self.model.family.clone().unwrap_or_default()
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_string())
}
