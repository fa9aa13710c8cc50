pub mod align;
pub mod classifier;
pub mod config;
pub mod convert;
pub mod error;
pub mod lm;
pub mod measure;
pub mod model;
pub mod perplexity;
pub mod predictor;
pub mod text;
pub mod tokenizer;
pub mod words;

pub use classifier::{ClassificationModel, LabelScore, TextClassifier};
pub use config::{Architecture, Config, DevicePolicy, PllPolicy, Precision};
pub use convert::{LogitsShape, Predictability, convert_to_predictability};
pub use error::{PredictError, Result};
pub use lm::LanguageModel;
pub use measure::{AlignmentRecord, PerplexityRecord, TokenMeasure, TokenStatus, WordPred};
pub use model::{LlamaCppModel, registry};
pub use predictor::{ByTokenPredictor, CausalPredictor, LogitsModel, MaskedPredictor};
pub use text::{Normalization, normalize};
pub use tokenizer::{EncodedText, HfTokenizer, Tokenizer};
pub use words::WordAggregator;
