//! Tokenizer and word aligner
//!
//! [`Tokenizer`] is the seam to the subword vocabulary. Predictors and the
//! aligner both go through [`Tokenizer::encode_batch`], so the positions they
//! describe agree by construction. [`HfTokenizer`] implements it over a
//! HuggingFace `tokenizer.json`.

use std::path::Path;

use tokenizers::models::ModelWrapper;
use tracing::debug;

use crate::config::TokenizerConfig;
use crate::error::{PredictError, Result};
use crate::measure::AlignmentRecord;
use crate::text::{Normalization, normalize};

/// One encoded text, padded to the longest text of its batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedText {
    /// The text the offsets refer to (after normalization)
    pub text: String,
    pub ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
    /// 1 for special tokens and padding
    pub special_tokens_mask: Vec<u32>,
    /// Word index per position; `None` for special tokens and padding
    pub word_ids: Vec<Option<u32>>,
    /// Byte offsets into `text`
    pub offsets: Vec<(usize, usize)>,
}

impl EncodedText {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of non-padding positions (they always form a prefix).
    pub fn unpadded_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }

    pub fn is_special(&self, position: usize) -> bool {
        self.special_tokens_mask.get(position).is_some_and(|&m| m != 0)
    }

    /// Pad in place to `len` positions with `pad_id`.
    fn pad_to(&mut self, len: usize, pad_id: u32) {
        let extra = len.saturating_sub(self.ids.len());
        self.ids.extend(std::iter::repeat_n(pad_id, extra));
        self.attention_mask.extend(std::iter::repeat_n(0, extra));
        self.special_tokens_mask.extend(std::iter::repeat_n(1, extra));
        self.word_ids.extend(std::iter::repeat_n(None, extra));
        self.offsets.extend(std::iter::repeat_n((0, 0), extra));
    }

    /// Token-to-word alignment of this encoding.
    ///
    /// Word indices are renumbered densely in first-appearance order; a
    /// word's surface form spans from its first token's start offset to its
    /// last token's end offset, trimmed of the leading space byte-level
    /// vocabularies attach to tokens.
    pub fn alignment(&self) -> AlignmentRecord {
        let mut raw_ids: Vec<u32> = Vec::new();
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut mapping = Vec::with_capacity(self.word_ids.len());

        for (word_id, &(start, end)) in self.word_ids.iter().zip(&self.offsets) {
            let Some(raw) = word_id else {
                mapping.push(None);
                continue;
            };
            let index = match raw_ids.iter().position(|r| r == raw) {
                Some(index) => {
                    let span = &mut spans[index];
                    span.0 = span.0.min(start);
                    span.1 = span.1.max(end);
                    index
                }
                None => {
                    raw_ids.push(*raw);
                    spans.push((start, end));
                    raw_ids.len() - 1
                }
            };
            mapping.push(Some(index));
        }

        let words = spans
            .iter()
            .map(|&(start, end)| self.text.get(start..end).map(|w| w.trim().to_string()))
            .collect();
        AlignmentRecord::new(words, mapping)
    }
}

/// Subword tokenizer with word alignment.
pub trait Tokenizer: Send + Sync {
    /// Name reported in word records
    fn name(&self) -> &str;

    /// Encode a batch, padding every text to the longest one.
    fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<Vec<EncodedText>>;

    /// Whether `id` is the unknown (out-of-vocabulary) token.
    fn is_unk_token_id(&self, id: u32) -> bool;

    fn pad_token_id(&self) -> Option<u32>;

    fn mask_token_id(&self) -> Option<u32>;

    /// Longest accepted encoding, special tokens included.
    fn model_max_length(&self) -> usize;

    /// Surface form of a vocabulary entry, for display.
    fn id_to_token(&self, _id: u32) -> Option<String> {
        None
    }

    /// Per-text word lists and token-to-word mappings.
    fn align_words_ids(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<AlignmentRecord>> {
        Ok(self
            .encode_batch(texts, add_special_tokens)?
            .iter()
            .map(EncodedText::alignment)
            .collect())
    }
}

/// Pad encodings to the longest one, or fail when padding is needed but no
/// pad token is known.
pub(crate) fn pad_batch(encodings: &mut [EncodedText], pad_id: Option<u32>) -> Result<()> {
    let longest = encodings.iter().map(EncodedText::len).max().unwrap_or(0);
    if encodings.iter().all(|e| e.len() == longest) {
        return Ok(());
    }
    let pad_id = pad_id.ok_or_else(|| {
        PredictError::config("batch needs padding but the tokenizer has no pad token")
    })?;
    for encoding in encodings.iter_mut() {
        encoding.pad_to(longest, pad_id);
    }
    Ok(())
}

const MASK_CANDIDATES: &[&str] = &["[MASK]", "<mask>"];

/// Unknown token id declared by the tokenizer model itself.
///
/// `None` when the model cannot emit unknowns (byte-level BPE, Unigram
/// without `unk_id`).
fn declared_unk_token_id(inner: &tokenizers::Tokenizer) -> Result<Option<u32>> {
    let token = match inner.get_model() {
        ModelWrapper::WordPiece(model) => Some(model.unk_token.clone()),
        ModelWrapper::WordLevel(model) => Some(model.unk_token.clone()),
        ModelWrapper::BPE(model) => model.unk_token.clone(),
        ModelWrapper::Unigram(model) => {
            // unk_id is private on Unigram but part of its serialized form
            let value =
                serde_json::to_value(model).map_err(|e| PredictError::TokenizerLoad(e.into()))?;
            let unk_id = value
                .get("unk_id")
                .and_then(serde_json::Value::as_u64)
                .and_then(|id| u32::try_from(id).ok());
            return Ok(unk_id);
        }
    };
    match token {
        Some(token) => inner.token_to_id(&token).map(Some).ok_or_else(|| {
            PredictError::config(format!(
                "tokenizer model declares unknown token '{}' that is not in the vocabulary",
                token
            ))
        }),
        None => Ok(None),
    }
}

/// HuggingFace `tokenizers` backed tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    name: String,
    unk_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    mask_token_id: Option<u32>,
    model_max_length: usize,
    normalization: Normalization,
}

impl HfTokenizer {
    /// Load a `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P, config: &TokenizerConfig) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(PredictError::TokenizerLoad)?;
        let mut config = config.clone();
        if config.name.is_none() {
            config.name = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|s| s.to_string_lossy().to_string());
        }
        Self::from_tokenizer(inner, &config)
    }

    /// Wrap an already constructed tokenizer.
    pub fn from_tokenizer(mut inner: tokenizers::Tokenizer, config: &TokenizerConfig) -> Result<Self> {
        let padding_id = inner.get_padding().map(|p| p.pad_id);
        // Padding and truncation are handled here; the library must not
        // change sequence lengths behind our back.
        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(PredictError::TokenizerLoad)?;

        let resolve = |explicit: &Option<String>, role: &str| -> Result<Option<u32>> {
            match explicit {
                Some(token) => inner.token_to_id(token).map(Some).ok_or_else(|| {
                    PredictError::config(format!(
                        "{} token '{}' is not in the vocabulary",
                        role, token
                    ))
                }),
                None => Ok(None),
            }
        };
        let first_known = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));

        let unk_token_id = match resolve(&config.unk_token, "unknown")? {
            Some(id) => Some(id),
            None => declared_unk_token_id(&inner)?,
        };
        let mask_token_id = resolve(&config.mask_token, "mask")?.or_else(|| first_known(MASK_CANDIDATES));
        let pad_token_id = resolve(&config.pad_token, "pad")?.or(padding_id);

        if unk_token_id.is_none() {
            debug!("Tokenizer model declares no unknown token; no word will be flagged as unknown");
        }

        let model_max_length = if config.model_max_length == 0 {
            usize::MAX
        } else {
            config.model_max_length
        };

        Ok(Self {
            inner,
            name: config.name.clone().unwrap_or_else(|| "tokenizer".to_string()),
            unk_token_id,
            pad_token_id,
            mask_token_id,
            model_max_length,
            normalization: config.normalization,
        })
    }

    fn encode_one(&self, batch_index: usize, text: &str, add_special_tokens: bool) -> Result<EncodedText> {
        let text = normalize(text, self.normalization).into_owned();
        let encoding = self
            .inner
            .encode(text.as_str(), add_special_tokens)
            .map_err(PredictError::Inference)?;
        if encoding.len() > self.model_max_length {
            return Err(PredictError::config(format!(
                "batch element {}: {} tokens exceed model_max_length {}",
                batch_index,
                encoding.len(),
                self.model_max_length
            )));
        }
        Ok(EncodedText {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
            special_tokens_mask: encoding.get_special_tokens_mask().to_vec(),
            word_ids: encoding.get_word_ids().to_vec(),
            offsets: encoding.get_offsets().to_vec(),
            text,
        })
    }
}

impl Tokenizer for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode_batch(&self, texts: &[&str], add_special_tokens: bool) -> Result<Vec<EncodedText>> {
        let mut encodings = texts
            .iter()
            .enumerate()
            .map(|(i, text)| self.encode_one(i, text, add_special_tokens))
            .collect::<Result<Vec<_>>>()?;
        pad_batch(&mut encodings, self.pad_token_id)?;
        Ok(encodings)
    }

    fn align_words_ids(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<AlignmentRecord>> {
        if self.inner.get_pre_tokenizer().is_none() {
            return Err(PredictError::config(format!(
                "tokenizer '{}' has no pre-tokenizer, so it cannot align tokens to words",
                self.name
            )));
        }
        Ok(self
            .encode_batch(texts, add_special_tokens)?
            .iter()
            .map(EncodedText::alignment)
            .collect())
    }

    fn is_unk_token_id(&self, id: u32) -> bool {
        self.unk_token_id == Some(id)
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    fn mask_token_id(&self) -> Option<u32> {
        self.mask_token_id
    }

    fn model_max_length(&self) -> usize {
        self.model_max_length
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(text: &str, word_ids: Vec<Option<u32>>, offsets: Vec<(usize, usize)>) -> EncodedText {
        let n = word_ids.len();
        EncodedText {
            text: text.to_string(),
            ids: (0..n as u32).collect(),
            attention_mask: vec![1; n],
            special_tokens_mask: word_ids.iter().map(|w| u32::from(w.is_none())).collect(),
            word_ids,
            offsets,
        }
    }

    #[test]
    fn test_alignment_groups_subwords() {
        // [CLS] The cat sat . [SEP]
        let enc = encoded(
            "The cat sat.",
            vec![None, Some(0), Some(1), Some(2), Some(2), None],
            vec![(0, 0), (0, 3), (4, 7), (8, 11), (11, 12), (0, 0)],
        );
        let record = enc.alignment();
        assert_eq!(
            record.words,
            vec![
                Some("The".to_string()),
                Some("cat".to_string()),
                Some("sat.".to_string())
            ]
        );
        assert_eq!(
            record.mapping_to_words,
            vec![None, Some(0), Some(1), Some(2), Some(2), None]
        );
    }

    #[test]
    fn test_alignment_renumbers_word_ids() {
        let enc = encoded("a b", vec![Some(4), Some(9)], vec![(0, 1), (2, 3)]);
        let record = enc.alignment();
        assert_eq!(record.mapping_to_words, vec![Some(0), Some(1)]);
        assert_eq!(record.words, vec![Some("a".into()), Some("b".into())]);
    }

    #[test]
    fn test_pad_batch() {
        let mut batch = vec![
            encoded("a b", vec![Some(0), Some(1)], vec![(0, 1), (2, 3)]),
            encoded("a", vec![Some(0)], vec![(0, 1)]),
        ];
        pad_batch(&mut batch, Some(99)).unwrap();
        assert_eq!(batch[1].ids, vec![0, 99]);
        assert_eq!(batch[1].attention_mask, vec![1, 0]);
        assert_eq!(batch[1].unpadded_len(), 1);
        assert!(batch[1].is_special(1));
        assert_eq!(batch[1].alignment().mapping_to_words, vec![Some(0), None]);
    }

    #[test]
    fn test_pad_batch_without_pad_token() {
        let mut batch = vec![
            encoded("a b", vec![Some(0), Some(1)], vec![(0, 1), (2, 3)]),
            encoded("a", vec![Some(0)], vec![(0, 1)]),
        ];
        assert!(matches!(
            pad_batch(&mut batch, None),
            Err(PredictError::Configuration(_))
        ));

        let mut same = vec![encoded("a", vec![Some(0)], vec![(0, 1)]); 2];
        pad_batch(&mut same, None).unwrap();
    }
}
