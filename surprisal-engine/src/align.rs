//! Length-checked join of token measures with token-to-word alignments.

use crate::error::{PredictError, Result};
use crate::measure::{AlignmentRecord, TokenMeasure};

/// Token measures of one text paired with its alignment.
///
/// Construction guarantees both sides cover the same number of positions.
#[derive(Debug, Clone, Copy)]
pub struct Joined<'a> {
    batch_index: usize,
    measures: &'a [TokenMeasure],
    alignment: &'a AlignmentRecord,
}

impl<'a> Joined<'a> {
    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    pub fn len(&self) -> usize {
        self.measures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    /// Word index of the token at `position`; `None` for special/pad tokens
    /// and for positions past either end.
    pub fn word_at(&self, position: usize) -> Option<usize> {
        self.alignment
            .mapping_to_words
            .get(position)
            .copied()
            .flatten()
    }

    /// Surface form of word `word_index`.
    pub fn word(&self, word_index: usize) -> Result<&'a str> {
        match self.alignment.words.get(word_index) {
            Some(Some(word)) => Ok(word.as_str()),
            Some(None) => Err(PredictError::config(format!(
                "batch element {}: word {} has no surface form",
                self.batch_index, word_index
            ))),
            None => Err(PredictError::config(format!(
                "batch element {}: word index {} outside {} words",
                self.batch_index,
                word_index,
                self.alignment.words.len()
            ))),
        }
    }

    /// Iterate `(position, measure, word index)` left to right.
    pub fn iter(self) -> impl Iterator<Item = (usize, &'a TokenMeasure, Option<usize>)> + 'a {
        self.measures
            .iter()
            .zip(self.alignment.mapping_to_words.iter().copied())
            .enumerate()
            .map(|(i, (m, w))| (i, m, w))
    }
}

/// Pair one text's measures with its alignment.
pub fn join<'a>(
    batch_index: usize,
    measures: &'a [TokenMeasure],
    alignment: &'a AlignmentRecord,
) -> Result<Joined<'a>> {
    if measures.len() != alignment.len() {
        return Err(PredictError::ShapeMismatch {
            batch_index,
            measures: measures.len(),
            alignments: alignment.len(),
        });
    }
    Ok(Joined {
        batch_index,
        measures,
        alignment,
    })
}

/// Pair every text of a batch, in input order.
///
/// Yields one item per batch index up to the longer of the two inputs; an
/// index present on only one side yields `MissingBatchElement`.
pub fn join_batch<'a>(
    measures: &'a [Vec<TokenMeasure>],
    alignments: &'a [AlignmentRecord],
) -> impl Iterator<Item = Result<Joined<'a>>> + 'a {
    let n = measures.len().max(alignments.len());
    (0..n).map(move |i| match (measures.get(i), alignments.get(i)) {
        (Some(m), Some(a)) => join(i, m, a),
        _ => Err(PredictError::MissingBatchElement {
            batch_index: i,
            measures: measures.len(),
            alignments: alignments.len(),
        }),
    })
}
