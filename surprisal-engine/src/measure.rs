//! Records passed between predictors, aligners and aggregators.

use serde::{Deserialize, Serialize};

/// Whether a token position carries a real prediction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    /// The model predicted this token; it counts towards perplexity.
    #[default]
    Scored,
    /// Context-only position that predicts nothing (e.g. the first token of
    /// a causal sequence).
    Context,
    /// Padding or a special token such as `[CLS]`.
    Special,
}

/// Predictability of the token occupying one position.
///
/// Records decoded without a `status` field fall back to the probability
/// sentinel rule of [`TokenMeasure::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawTokenMeasure")]
pub struct TokenMeasure {
    pub token_id: u32,
    /// Probability in (0, 1]
    pub probability: f64,
    /// Surprisal in bits
    pub surprisal: f64,
    pub status: TokenStatus,
}

#[derive(Deserialize)]
struct RawTokenMeasure {
    token_id: u32,
    probability: f64,
    surprisal: f64,
    #[serde(default)]
    status: Option<TokenStatus>,
}

impl From<RawTokenMeasure> for TokenMeasure {
    fn from(raw: RawTokenMeasure) -> Self {
        match raw.status {
            Some(status) => Self {
                token_id: raw.token_id,
                probability: raw.probability,
                surprisal: raw.surprisal,
                status,
            },
            None => Self::new(raw.token_id, raw.probability, raw.surprisal),
        }
    }
}

impl TokenMeasure {
    /// Build a measure from a raw `(id, probability, surprisal)` triple.
    ///
    /// A probability of exactly 1.0 marks an unscored context position.
    pub fn new(token_id: u32, probability: f64, surprisal: f64) -> Self {
        let status = if probability == 1.0 {
            TokenStatus::Context
        } else {
            TokenStatus::Scored
        };
        Self {
            token_id,
            probability,
            surprisal,
            status,
        }
    }

    /// A scored measure from a natural-log probability.
    pub fn from_log_prob(token_id: u32, log_prob: f64) -> Self {
        Self {
            token_id,
            probability: log_prob.exp(),
            surprisal: -log_prob / std::f64::consts::LN_2,
            status: TokenStatus::Scored,
        }
    }

    /// An unscored context position.
    pub fn context(token_id: u32) -> Self {
        Self::unscored(token_id, TokenStatus::Context)
    }

    /// An unscored padding/special position.
    pub fn special(token_id: u32) -> Self {
        Self::unscored(token_id, TokenStatus::Special)
    }

    fn unscored(token_id: u32, status: TokenStatus) -> Self {
        Self {
            token_id,
            probability: 1.0,
            surprisal: 0.0,
            status,
        }
    }

    pub fn is_scored(&self) -> bool {
        self.status == TokenStatus::Scored
    }
}

/// Token-to-word alignment for one text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentRecord {
    /// One entry per distinct word, in first-appearance order
    pub words: Vec<Option<String>>,
    /// One entry per token position; `None` for special/pad tokens
    pub mapping_to_words: Vec<Option<usize>>,
}

impl AlignmentRecord {
    pub fn new(words: Vec<Option<String>>, mapping_to_words: Vec<Option<usize>>) -> Self {
        Self {
            words,
            mapping_to_words,
        }
    }

    /// Number of token positions covered by the mapping.
    pub fn len(&self) -> usize {
        self.mapping_to_words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping_to_words.is_empty()
    }

    /// Number of distinct words reached by at least one token.
    pub fn word_count(&self) -> usize {
        let mut count = 0;
        let mut prev = None;
        for w in self.mapping_to_words.iter().flatten() {
            if prev != Some(*w) {
                count += 1;
                prev = Some(*w);
            }
        }
        count
    }
}

/// Predictability of one word, reassembled from its subword tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordPred {
    pub word: String,
    /// Total surprisal of the constituent tokens (bits)
    pub surp: f64,
    /// Joint probability of the constituent tokens
    pub prob: f64,
    /// Whether the word spans more than one token
    #[serde(rename = "isSplit")]
    pub is_split: bool,
    /// Whether any constituent token is the unknown token
    #[serde(rename = "isUnk")]
    pub is_unk: bool,
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(rename = "tokenizerName")]
    pub tokenizer_name: String,
}

/// Perplexity of one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerplexityRecord {
    pub text: String,
    pub perplexity: f64,
    /// Number of scored positions
    pub length: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_classifies_sentinel() {
        assert_eq!(TokenMeasure::new(5, 1.0, 0.0).status, TokenStatus::Context);
        assert_eq!(TokenMeasure::new(5, 0.5, 1.0).status, TokenStatus::Scored);
    }

    #[test]
    fn test_from_log_prob() {
        let m = TokenMeasure::from_log_prob(7, 0.25f64.ln());
        assert!((m.probability - 0.25).abs() < 1e-12);
        assert!((m.surprisal - 2.0).abs() < 1e-12);
        assert!(m.is_scored());
    }

    #[test]
    fn test_unscored_constructors() {
        let c = TokenMeasure::context(1);
        let s = TokenMeasure::special(0);
        assert_eq!(c.probability, 1.0);
        assert_eq!(c.surprisal, 0.0);
        assert_eq!(c.status, TokenStatus::Context);
        assert_eq!(s.status, TokenStatus::Special);
        assert!(!s.is_scored());
    }

    #[test]
    fn test_deserialize_status() {
        let legacy: TokenMeasure =
            serde_json::from_str(r#"{"token_id": 3, "probability": 1.0, "surprisal": 0.0}"#)
                .unwrap();
        assert_eq!(legacy.status, TokenStatus::Context);

        let explicit: TokenMeasure = serde_json::from_str(
            r#"{"token_id": 3, "probability": 1.0, "surprisal": 0.0, "status": "special"}"#,
        )
        .unwrap();
        assert_eq!(explicit.status, TokenStatus::Special);

        let scored = TokenMeasure::new(4, 0.5, 1.0);
        let back: TokenMeasure =
            serde_json::from_str(&serde_json::to_string(&scored).unwrap()).unwrap();
        assert_eq!(back, scored);
    }

    #[test]
    fn test_word_count_skips_sentinels() {
        let record = AlignmentRecord::new(
            vec![Some("The".into()), Some("cat".into())],
            vec![None, Some(0), Some(1), Some(1), None, None],
        );
        assert_eq!(record.len(), 6);
        assert_eq!(record.word_count(), 2);
    }

    #[test]
    fn test_word_pred_json_field_names() {
        let pred = WordPred {
            word: "cat".into(),
            surp: 1.0,
            prob: 0.5,
            is_split: false,
            is_unk: true,
            model_name: "gpt2".into(),
            tokenizer_name: "gpt2".into(),
        };
        let json = serde_json::to_value(&pred).unwrap();
        assert_eq!(json["isSplit"], false);
        assert_eq!(json["isUnk"], true);
        assert_eq!(json["modelName"], "gpt2");
        assert_eq!(json["tokenizerName"], "gpt2");
    }
}
