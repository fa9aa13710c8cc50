//! Sequence classification over a padded batch.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{Config, LabelMap, LoadMode};
use crate::convert::log_softmax;
use crate::error::{PredictError, Result};
use crate::tokenizer::{EncodedText, Tokenizer};

/// Numeric kernel of a sequence classifier.
pub trait ClassificationModel: Send + Sync {
    fn name(&self) -> &str;

    fn num_labels(&self) -> usize;

    /// Logits for a padded batch, row-major `[batch.len(), num_labels]`.
    fn forward(&self, batch: &[EncodedText]) -> Result<Vec<f32>>;
}

/// Raw classifier output for one text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextOutput {
    pub input_ids: Vec<u32>,
    /// Last position not covered by padding, `None` for an empty encoding
    pub last_non_masked_idx: Option<usize>,
    pub logits: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub id: u32,
    pub label: String,
    pub probability: f64,
}

/// Index of the last attended position.
pub fn last_non_masked_idx(attention_mask: &[u32]) -> Option<usize> {
    attention_mask
        .iter()
        .filter(|&&m| m != 0)
        .count()
        .checked_sub(1)
}

pub struct TextClassifier<M> {
    model: M,
    tokenizer: Arc<dyn Tokenizer>,
    labels: LabelMap,
}

impl<M: ClassificationModel> TextClassifier<M> {
    /// Fails when the label map does not cover the model's labels.
    pub fn new(model: M, tokenizer: Arc<dyn Tokenizer>, labels: LabelMap) -> Result<Self> {
        if !labels.is_empty() && labels.id2label.len() != model.num_labels() {
            return Err(PredictError::config(format!(
                "{} has {} labels but id2label has {} entries",
                model.name(),
                model.num_labels(),
                labels.id2label.len()
            )));
        }
        Ok(Self {
            model,
            tokenizer,
            labels,
        })
    }

    /// Build from the `[model]` and `[labels]` sections of a configuration.
    ///
    /// A configured `num_labels` must equal the model's head width; in
    /// finetune mode it is required.
    pub fn from_config(model: M, tokenizer: Arc<dyn Tokenizer>, config: &Config) -> Result<Self> {
        match (config.model.load_mode, config.model.num_labels) {
            (_, Some(n)) if n != model.num_labels() => {
                return Err(PredictError::config(format!(
                    "model.num_labels is {} but {} has {} labels",
                    n,
                    model.name(),
                    model.num_labels()
                )));
            }
            (LoadMode::Finetune, None) => {
                return Err(PredictError::config(
                    "model.num_labels must be set when load_mode is finetune",
                ));
            }
            _ => {}
        }
        Self::new(model, tokenizer, config.label_map()?)
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Display name of a label id, falling back to `LABEL_<id>`.
    pub fn label_name(&self, id: u32) -> String {
        self.labels
            .label(id)
            .map_or_else(|| format!("LABEL_{}", id), str::to_string)
    }

    /// Logits and last unpadded position of every text.
    pub fn text_output(&self, texts: &[&str]) -> Result<Vec<TextOutput>> {
        let batch = self.tokenizer.encode_batch(texts, true)?;
        let n_labels = self.model.num_labels();
        let logits = self.model.forward(&batch)?;
        if logits.len() != batch.len() * n_labels {
            return Err(PredictError::Inference(
                format!(
                    "{} returned {} logits for {} texts of {} labels",
                    self.model.name(),
                    logits.len(),
                    batch.len(),
                    n_labels
                )
                .into(),
            ));
        }
        Ok(batch
            .into_iter()
            .zip(logits.chunks(n_labels.max(1)))
            .map(|(encoding, row)| TextOutput {
                last_non_masked_idx: last_non_masked_idx(&encoding.attention_mask),
                input_ids: encoding.ids,
                logits: row.to_vec(),
            })
            .collect())
    }

    /// Label distribution of every text, in label id order.
    pub fn label_probabilities(&self, texts: &[&str]) -> Result<Vec<Vec<LabelScore>>> {
        self.text_output(texts)?
            .iter()
            .enumerate()
            .map(|(b, output)| {
                if let Some((position, &value)) =
                    output.logits.iter().enumerate().find(|(_, v)| !v.is_finite())
                {
                    return Err(PredictError::Numeric {
                        batch_index: b,
                        position,
                        value,
                    });
                }
                Ok(log_softmax(&output.logits)
                    .into_iter()
                    .enumerate()
                    .map(|(id, lp)| LabelScore {
                        id: id as u32,
                        label: self.label_name(id as u32),
                        probability: lp.exp(),
                    })
                    .collect())
            })
            .collect()
    }

    /// Most probable label of every text.
    pub fn predict(&self, texts: &[&str]) -> Result<Vec<LabelScore>> {
        self.label_probabilities(texts)?
            .into_iter()
            .enumerate()
            .map(|(b, scores)| {
                scores
                    .into_iter()
                    .max_by(|x, y| x.probability.total_cmp(&y.probability))
                    .ok_or(PredictError::DegenerateInput { batch_index: b })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelSettings;
    use crate::predictor::testing::StubTokenizer;

    /// Scores label 1 by the number of attended tokens.
    struct LengthClassifier;

    impl ClassificationModel for LengthClassifier {
        fn name(&self) -> &str {
            "length"
        }

        fn num_labels(&self) -> usize {
            2
        }

        fn forward(&self, batch: &[EncodedText]) -> Result<Vec<f32>> {
            Ok(batch
                .iter()
                .flat_map(|e| [2.0, e.unpadded_len() as f32])
                .collect())
        }
    }

    fn labels() -> LabelMap {
        let settings = LabelSettings {
            id2label: [("0", "short"), ("1", "long")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        settings.resolve().unwrap()
    }

    fn classifier() -> TextClassifier<LengthClassifier> {
        TextClassifier::new(
            LengthClassifier,
            Arc::new(StubTokenizer::new(&["a", "b", "c"])),
            labels(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_config_checks_head_width() {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(StubTokenizer::new(&["a", "b", "c"]));

        let config = Config::from_toml_str(
            r#"
[model]
load_mode = "finetune"
num_labels = 2

[labels]
id2label = { "0" = "short", "1" = "long" }
"#,
        )
        .unwrap();
        let clf = TextClassifier::from_config(LengthClassifier, tokenizer.clone(), &config).unwrap();
        assert_eq!(clf.label_name(1), "long");

        let config = Config::from_toml_str("[model]\nload_mode = \"finetune\"\nnum_labels = 3\n").unwrap();
        let err = TextClassifier::from_config(LengthClassifier, tokenizer.clone(), &config)
            .err()
            .unwrap();
        assert!(err.to_string().contains("num_labels"));

        // Pretrained heads keep their own width
        let config = Config::from_toml_str("").unwrap();
        let clf = TextClassifier::from_config(LengthClassifier, tokenizer, &config).unwrap();
        assert_eq!(clf.label_name(0), "LABEL_0");
    }

    #[test]
    fn test_last_non_masked_idx() {
        assert_eq!(last_non_masked_idx(&[1, 1, 1, 0, 0]), Some(2));
        assert_eq!(last_non_masked_idx(&[1]), Some(0));
        assert_eq!(last_non_masked_idx(&[0, 0]), None);
        assert_eq!(last_non_masked_idx(&[]), None);
    }

    #[test]
    fn test_text_output() {
        let out = classifier().text_output(&["a b c", "a"]).unwrap();
        // [CLS] a b c [SEP] / [CLS] a [SEP] [PAD] [PAD]
        assert_eq!(out[0].last_non_masked_idx, Some(4));
        assert_eq!(out[1].last_non_masked_idx, Some(2));
        assert_eq!(out[1].input_ids.len(), 5);
        assert_eq!(out[1].logits, vec![2.0, 3.0]);
    }

    #[test]
    fn test_label_probabilities_sum_to_one() {
        let scores = classifier().label_probabilities(&["a b c", "a"]).unwrap();
        for row in &scores {
            let total: f64 = row.iter().map(|s| s.probability).sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert_eq!(row[0].label, "short");
            assert_eq!(row[1].label, "long");
        }
    }

    #[test]
    fn test_predict() {
        let top = classifier().predict(&["a b c", "a"]).unwrap();
        assert_eq!(top[0].label, "long");
        assert_eq!(top[1].label, "long");
        assert!(top[0].probability > top[1].probability);
    }

    #[test]
    fn test_label_map_must_cover_model() {
        let mut map = labels();
        map.id2label.remove(&1);
        let err = TextClassifier::new(
            LengthClassifier,
            Arc::new(StubTokenizer::new(&[])),
            map,
        )
        .err()
        .unwrap();
        assert!(matches!(err, PredictError::Configuration(_)));
    }

    #[test]
    fn test_unlabelled_fallback() {
        let clf = TextClassifier::new(
            LengthClassifier,
            Arc::new(StubTokenizer::new(&[])),
            LabelMap::default(),
        )
        .unwrap();
        assert_eq!(clf.label_name(1), "LABEL_1");
    }
}
