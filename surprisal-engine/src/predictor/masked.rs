use std::sync::Arc;

use tracing::debug;

use super::{ByTokenPredictor, LogitsModel, forward_checked};
use crate::config::PllPolicy;
use crate::convert::token_measure;
use crate::error::{PredictError, Result};
use crate::measure::TokenMeasure;
use crate::tokenizer::{EncodedText, Tokenizer};

/// Pseudo-log-likelihood predictor for bidirectional models.
///
/// Each non-special position is scored by a forward pass over the sequence
/// with that position replaced by the mask token. Under
/// [`PllPolicy::Modified`] the later subword pieces of the same word are
/// masked too, so a word is not scored with its own continuation in view.
///
/// The model always sees the sequence with its special tokens; when the
/// caller asks for an encoding without them, the measures are re-projected
/// onto that encoding.
pub struct MaskedPredictor<M> {
    model: M,
    tokenizer: Arc<dyn Tokenizer>,
    pll: PllPolicy,
    mask_id: u32,
}

impl<M: LogitsModel> MaskedPredictor<M> {
    /// Fails when the tokenizer has no mask token.
    pub fn new(model: M, tokenizer: Arc<dyn Tokenizer>, pll: PllPolicy) -> Result<Self> {
        let mask_id = tokenizer.mask_token_id().ok_or_else(|| {
            PredictError::config(format!(
                "tokenizer {} has no mask token; masked scoring needs one",
                tokenizer.name()
            ))
        })?;
        Ok(Self {
            model,
            tokenizer,
            pll,
            mask_id,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn pll(&self) -> PllPolicy {
        self.pll
    }

    /// Input ids with `position` masked, plus the right-hand pieces of its
    /// word under the modified policy.
    fn masked_input(&self, encoding: &EncodedText, n: usize, position: usize) -> Vec<u32> {
        let mut ids = encoding.ids[..n].to_vec();
        ids[position] = self.mask_id;
        if self.pll == PllPolicy::Modified
            && let Some(word) = encoding.word_ids[position]
        {
            for (j, id) in ids.iter_mut().enumerate().skip(position + 1) {
                if encoding.word_ids[j] == Some(word) {
                    *id = self.mask_id;
                }
            }
        }
        ids
    }

    fn score(&self, batch_index: usize, encoding: &EncodedText) -> Result<Vec<TokenMeasure>> {
        let n = encoding.unpadded_len();
        let vocab = self.model.vocab_size();
        let mut measures = Vec::with_capacity(encoding.len());
        for (pos, &id) in encoding.ids.iter().enumerate() {
            if pos >= n || encoding.is_special(pos) {
                measures.push(TokenMeasure::special(id));
                continue;
            }
            let input = self.masked_input(encoding, n, pos);
            let logits = forward_checked(&self.model, batch_index, &input)?;
            let row = &logits[pos * vocab..(pos + 1) * vocab];
            measures.push(token_measure(row, id, batch_index, pos)?);
        }
        Ok(measures)
    }
}

/// Carry the measures of the non-special positions of `full` over to
/// `plain`, the same text encoded without special tokens.
fn project(
    batch_index: usize,
    full: &EncodedText,
    measures: Vec<TokenMeasure>,
    plain: &EncodedText,
) -> Result<Vec<TokenMeasure>> {
    let full_len = full.unpadded_len();
    let mut content = measures
        .into_iter()
        .enumerate()
        .filter(|(pos, _)| *pos < full_len && !full.is_special(*pos))
        .map(|(_, m)| m);

    let n = plain.unpadded_len();
    let mut out = Vec::with_capacity(plain.len());
    for (pos, &id) in plain.ids.iter().enumerate() {
        if pos >= n || plain.is_special(pos) {
            out.push(TokenMeasure::special(id));
            continue;
        }
        match content.next() {
            Some(m) if m.token_id == id => out.push(m),
            _ => {
                return Err(PredictError::Inference(
                    format!(
                        "batch element {}: encodings with and without special tokens disagree at position {}",
                        batch_index, pos
                    )
                    .into(),
                ));
            }
        }
    }
    Ok(out)
}

impl<M: LogitsModel> ByTokenPredictor for MaskedPredictor<M> {
    fn model_name(&self) -> &str {
        self.model.name()
    }

    fn by_token_predictability(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Vec<TokenMeasure>>> {
        let full = self.tokenizer.encode_batch(texts, true)?;
        let forward_passes: usize = full
            .iter()
            .map(|e| (0..e.unpadded_len()).filter(|&p| !e.is_special(p)).count())
            .sum();
        debug!(
            "masked scoring ({:?}): {} texts, {} forward passes",
            self.pll,
            full.len(),
            forward_passes
        );

        let scored = full
            .iter()
            .enumerate()
            .map(|(b, encoding)| self.score(b, encoding));
        if add_special_tokens {
            return scored.collect();
        }

        let plain = self.tokenizer.encode_batch(texts, false)?;
        scored
            .zip(full.iter().zip(&plain))
            .enumerate()
            .map(|(b, (measures, (full, plain)))| project(b, full, measures?, plain))
            .collect()
    }
}
