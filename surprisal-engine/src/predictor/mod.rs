//! Token predictors
//!
//! A [`ByTokenPredictor`] turns a batch of texts into one [`TokenMeasure`]
//! per token position. The numeric forward pass sits behind [`LogitsModel`];
//! the predictor decides which positions are fed to it and which logits row
//! scores which token.

mod causal;
mod masked;

use std::sync::Arc;

pub use causal::CausalPredictor;
pub use masked::MaskedPredictor;

use crate::config::{Architecture, PllPolicy};
use crate::error::{PredictError, Result};
use crate::measure::TokenMeasure;
use crate::tokenizer::Tokenizer;

/// Numeric kernel of a language model.
pub trait LogitsModel: Send + Sync {
    /// Model identity reported in word records
    fn name(&self) -> &str;

    fn vocab_size(&self) -> usize;

    /// Logits for every position of `input_ids`, row-major
    /// `[input_ids.len(), vocab_size]`.
    fn forward(&self, input_ids: &[u32]) -> Result<Vec<f32>>;
}

impl<M: LogitsModel + ?Sized> LogitsModel for Arc<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn forward(&self, input_ids: &[u32]) -> Result<Vec<f32>> {
        (**self).forward(input_ids)
    }
}

/// Per-token predictability of a batch of texts.
///
/// The n-th output sequence belongs to the n-th text and holds exactly one
/// measure per position of the tokenizer's encoding of that text (padding
/// included), in order.
pub trait ByTokenPredictor: Send + Sync {
    fn model_name(&self) -> &str;

    fn by_token_predictability(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Vec<TokenMeasure>>>;
}

/// Pick the predictor for an architecture family.
pub fn build_predictor<M>(
    architecture: Architecture,
    pll: PllPolicy,
    model: M,
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<Box<dyn ByTokenPredictor>>
where
    M: LogitsModel + 'static,
{
    Ok(match architecture {
        Architecture::Causal => Box::new(CausalPredictor::new(model, tokenizer)),
        Architecture::Masked => Box::new(MaskedPredictor::new(model, tokenizer, pll)?),
    })
}

/// Run the model and check it returned one row per input position.
fn forward_checked<M: LogitsModel + ?Sized>(
    model: &M,
    batch_index: usize,
    input_ids: &[u32],
) -> Result<Vec<f32>> {
    let logits = model.forward(input_ids)?;
    let expected = input_ids.len() * model.vocab_size();
    if logits.len() != expected {
        return Err(PredictError::Inference(
            format!(
                "batch element {}: model returned {} logits for {} positions of vocabulary {}",
                batch_index,
                logits.len(),
                input_ids.len(),
                model.vocab_size()
            )
            .into(),
        ));
    }
    Ok(logits)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-ins for a tokenizer and a model.

    use super::*;
    use crate::tokenizer::{EncodedText, pad_batch};

    pub const PAD: u32 = 0;
    pub const UNK: u32 = 1;
    pub const CLS: u32 = 2;
    pub const SEP: u32 = 3;
    pub const MASK: u32 = 4;

    /// Whitespace tokenizer that splits every word longer than four bytes
    /// into a four-byte head and a tail piece.
    pub struct StubTokenizer {
        pub vocab: Vec<String>,
    }

    impl StubTokenizer {
        pub fn new(words: &[&str]) -> Self {
            let mut vocab: Vec<String> = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            vocab.extend(words.iter().map(|s| s.to_string()));
            Self { vocab }
        }

        fn id(&self, piece: &str) -> u32 {
            self.vocab
                .iter()
                .position(|v| v == piece)
                .map_or(UNK, |i| i as u32)
        }
    }

    impl Tokenizer for StubTokenizer {
        fn name(&self) -> &str {
            "stub-tokenizer"
        }

        fn encode_batch(
            &self,
            texts: &[&str],
            add_special_tokens: bool,
        ) -> Result<Vec<EncodedText>> {
            let mut out: Vec<EncodedText> = texts
                .iter()
                .map(|text| {
                    let mut enc = EncodedText {
                        text: text.to_string(),
                        ..Default::default()
                    };
                    let mut push = |id: u32, word: Option<u32>, span: (usize, usize), special| {
                        enc.ids.push(id);
                        enc.attention_mask.push(1);
                        enc.special_tokens_mask.push(special);
                        enc.word_ids.push(word);
                        enc.offsets.push(span);
                    };
                    if add_special_tokens {
                        push(CLS, None, (0, 0), 1);
                    }
                    let mut cursor = 0;
                    for (w, word) in text.split_whitespace().enumerate() {
                        let start = cursor + text[cursor..].find(word).unwrap_or(0);
                        cursor = start + word.len();
                        let w = Some(w as u32);
                        if word.len() > 4 && word.is_char_boundary(4) {
                            push(self.id(&word[..4]), w, (start, start + 4), 0);
                            push(self.id(&word[4..]), w, (start + 4, cursor), 0);
                        } else {
                            push(self.id(word), w, (start, cursor), 0);
                        }
                    }
                    if add_special_tokens {
                        push(SEP, None, (0, 0), 1);
                    }
                    enc
                })
                .collect();
            pad_batch(&mut out, Some(PAD))?;
            Ok(out)
        }

        fn is_unk_token_id(&self, id: u32) -> bool {
            id == UNK
        }

        fn pad_token_id(&self) -> Option<u32> {
            Some(PAD)
        }

        fn mask_token_id(&self) -> Option<u32> {
            Some(MASK)
        }

        fn model_max_length(&self) -> usize {
            512
        }

        fn id_to_token(&self, id: u32) -> Option<String> {
            self.vocab.get(id as usize).cloned()
        }
    }

    /// Model whose logits at every position favour one fixed token id.
    ///
    /// Every row is `favoured -> ln(3)`, all others `0`; with a vocabulary
    /// of `v` the favoured token has probability `3 / (v + 2)`.
    pub struct StubModel {
        pub vocab: usize,
        pub favoured: u32,
        pub calls: std::sync::Mutex<Vec<Vec<u32>>>,
    }

    impl StubModel {
        pub fn new(vocab: usize, favoured: u32) -> Self {
            Self {
                vocab,
                favoured,
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }

        pub fn favoured_prob(&self) -> f64 {
            3.0 / (self.vocab as f64 + 2.0)
        }

        pub fn other_prob(&self) -> f64 {
            1.0 / (self.vocab as f64 + 2.0)
        }
    }

    impl LogitsModel for StubModel {
        fn name(&self) -> &str {
            "stub-model"
        }

        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn forward(&self, input_ids: &[u32]) -> Result<Vec<f32>> {
            self.calls.lock().unwrap().push(input_ids.to_vec());
            let mut logits = vec![0.0f32; input_ids.len() * self.vocab];
            for row in logits.chunks_mut(self.vocab) {
                row[self.favoured as usize] = 3.0f32.ln();
            }
            Ok(logits)
        }
    }
}
