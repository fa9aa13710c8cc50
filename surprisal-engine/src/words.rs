//! Word-level predictability from subword token measures.

use crate::align::{Joined, join_batch};
use crate::error::Result;
use crate::measure::{AlignmentRecord, TokenMeasure, WordPred};

/// Merges per-token measures into per-word joint statistics.
///
/// `is_unk` classifies a token id as the tokenizer's unknown token.
pub struct WordAggregator<F> {
    model_name: String,
    tokenizer_name: String,
    is_unk: F,
}

impl<F> WordAggregator<F>
where
    F: Fn(u32) -> bool,
{
    pub fn new(model_name: impl Into<String>, tokenizer_name: impl Into<String>, is_unk: F) -> Self {
        Self {
            model_name: model_name.into(),
            tokenizer_name: tokenizer_name.into(),
            is_unk,
        }
    }

    /// Aggregate a whole batch; the first failing text aborts the batch.
    pub fn aggregate(
        &self,
        measures: &[Vec<TokenMeasure>],
        alignments: &[AlignmentRecord],
    ) -> Result<Vec<Vec<WordPred>>> {
        join_batch(measures, alignments)
            .map(|joined| self.aggregate_text(joined?))
            .collect()
    }

    /// Aggregate a batch with one result per text, in input order.
    pub fn aggregate_each(
        &self,
        measures: &[Vec<TokenMeasure>],
        alignments: &[AlignmentRecord],
    ) -> Vec<Result<Vec<WordPred>>> {
        join_batch(measures, alignments)
            .map(|joined| self.aggregate_text(joined?))
            .collect()
    }

    /// Walk one text left to right, emitting a word at each word boundary.
    pub fn aggregate_text(&self, joined: Joined<'_>) -> Result<Vec<WordPred>> {
        let mut words = Vec::new();
        let mut prob = 1.0f64;
        let mut surp = 0.0f64;
        let mut is_unk = false;
        let last = joined.len().saturating_sub(1);

        for (i, measure, word_index) in joined.iter() {
            prob *= measure.probability;
            surp += measure.surprisal;
            if (self.is_unk)(measure.token_id) {
                is_unk = true;
            }

            let Some(w) = word_index else {
                // special/pad position
                prob = 1.0;
                surp = 0.0;
                continue;
            };

            if i == last || joined.word_at(i + 1) != Some(w) {
                let is_split = i > 0 && joined.word_at(i - 1) == Some(w);
                words.push(WordPred {
                    word: joined.word(w)?.to_string(),
                    surp,
                    prob,
                    is_split,
                    is_unk,
                    model_name: self.model_name.clone(),
                    tokenizer_name: self.tokenizer_name.clone(),
                });
                prob = 1.0;
                surp = 0.0;
                is_unk = false;
            }
        }

        tracing::trace!(
            "batch element {}: {} words from {} tokens",
            joined.batch_index(),
            words.len(),
            joined.len()
        );
        Ok(words)
    }
}
