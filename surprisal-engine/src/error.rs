//! Error types for predictability scoring

/// Errors that can occur while scoring or aggregating predictability.
///
/// Every per-text failure names the offending batch index.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error(
        "batch element {batch_index}: {measures} token measures but {alignments} aligned positions"
    )]
    ShapeMismatch {
        batch_index: usize,
        measures: usize,
        alignments: usize,
    },

    #[error(
        "batch element {batch_index} is missing: {measures} measure sequences but {alignments} alignments"
    )]
    MissingBatchElement {
        batch_index: usize,
        measures: usize,
        alignments: usize,
    },

    #[error("batch element {batch_index}: no scored positions")]
    DegenerateInput { batch_index: usize },

    #[error("batch element {batch_index}, position {position}: non-finite value {value}")]
    Numeric {
        batch_index: usize,
        position: usize,
        value: f32,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown model variant: '{0}'")]
    UnknownVariant(String),

    #[error("download failed")]
    Download(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("model load failed")]
    ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("tokenizer load failed")]
    TokenizerLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("inference failed")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PredictError {
    /// Build a configuration error from anything printable.
    pub fn config(msg: impl Into<String>) -> Self {
        PredictError::Configuration(msg.into())
    }

    /// Batch index carried by a per-text failure, if any.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            PredictError::ShapeMismatch { batch_index, .. }
            | PredictError::MissingBatchElement { batch_index, .. }
            | PredictError::DegenerateInput { batch_index }
            | PredictError::Numeric { batch_index, .. } => Some(*batch_index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PredictError>;
