use std::sync::Arc;

use tracing::debug;

use super::{ByTokenPredictor, LogitsModel, forward_checked};
use crate::convert::token_measure;
use crate::error::Result;
use crate::measure::TokenMeasure;
use crate::tokenizer::{EncodedText, Tokenizer};

/// Left-to-right predictor: the token at position `i` is scored by the
/// logits row the model produced at `i - 1`.
///
/// The first position has no preceding context and is reported as
/// [`TokenStatus::Context`](crate::measure::TokenStatus::Context).
pub struct CausalPredictor<M> {
    model: M,
    tokenizer: Arc<dyn Tokenizer>,
}

impl<M: LogitsModel> CausalPredictor<M> {
    pub fn new(model: M, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { model, tokenizer }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn score(&self, batch_index: usize, encoding: &EncodedText) -> Result<Vec<TokenMeasure>> {
        let n = encoding.unpadded_len();
        let mut measures = Vec::with_capacity(encoding.len());
        if n > 0 {
            let ids = &encoding.ids[..n];
            let logits = forward_checked(&self.model, batch_index, ids)?;
            let vocab = self.model.vocab_size();
            measures.push(TokenMeasure::context(ids[0]));
            for (pos, &id) in ids.iter().enumerate().skip(1) {
                if encoding.is_special(pos) {
                    measures.push(TokenMeasure::special(id));
                    continue;
                }
                let row = &logits[(pos - 1) * vocab..pos * vocab];
                measures.push(token_measure(row, id, batch_index, pos)?);
            }
        }
        measures.extend(encoding.ids[n..].iter().map(|&id| TokenMeasure::special(id)));
        Ok(measures)
    }
}

impl<M: LogitsModel> ByTokenPredictor for CausalPredictor<M> {
    fn model_name(&self) -> &str {
        self.model.name()
    }

    fn by_token_predictability(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Vec<TokenMeasure>>> {
        let encodings = self.tokenizer.encode_batch(texts, add_special_tokens)?;
        debug!(
            "causal scoring: {} texts, {} positions each",
            encodings.len(),
            encodings.first().map_or(0, EncodedText::len)
        );
        encodings
            .iter()
            .enumerate()
            .map(|(b, encoding)| self.score(b, encoding))
            .collect()
    }
}
