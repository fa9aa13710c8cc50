//! Sequence-level perplexity from token measures.
//!
//! Only positions that are both scored and aligned to a word count towards
//! the mean surprisal, so the same reduction serves causal and masked
//! scoring alike.

use crate::align::{Joined, join_batch};
use crate::error::{PredictError, Result};
use crate::measure::{AlignmentRecord, PerplexityRecord, TokenMeasure};

/// Total surprisal and number of scored positions of one text.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SurprisalTotal {
    pub surprisal: f64,
    pub length: usize,
}

impl SurprisalTotal {
    /// `2^(surprisal / length)`; fails when nothing was scored.
    pub fn perplexity(&self, batch_index: usize) -> Result<f64> {
        if self.length == 0 {
            return Err(PredictError::DegenerateInput { batch_index });
        }
        Ok((self.surprisal / self.length as f64).exp2())
    }
}

/// Accumulate the scored positions of one text.
pub fn accumulate(joined: Joined<'_>) -> SurprisalTotal {
    let mut total = SurprisalTotal::default();
    for (_, measure, word_index) in joined.iter() {
        // Skip context positions and pad/special tokens
        if !measure.is_scored() || word_index.is_none() {
            continue;
        }
        total.surprisal += measure.surprisal;
        total.length += 1;
    }
    total
}

/// Perplexity of every text of a batch; the first failure aborts.
pub fn batch_perplexity<S: AsRef<str>>(
    texts: &[S],
    measures: &[Vec<TokenMeasure>],
    alignments: &[AlignmentRecord],
) -> Result<Vec<PerplexityRecord>> {
    each_perplexity(texts, measures, alignments)
        .into_iter()
        .collect()
}

/// Perplexity of every text of a batch, one result per text in input order.
pub fn each_perplexity<S: AsRef<str>>(
    texts: &[S],
    measures: &[Vec<TokenMeasure>],
    alignments: &[AlignmentRecord],
) -> Vec<Result<PerplexityRecord>> {
    let n = texts.len().max(measures.len()).max(alignments.len());
    let mut joined = join_batch(measures, alignments);
    (0..n)
        .map(|i| {
            let joined = joined.next().unwrap_or(Err(PredictError::MissingBatchElement {
                batch_index: i,
                measures: measures.len(),
                alignments: alignments.len(),
            }))?;
            let text = texts.get(i).ok_or(PredictError::MissingBatchElement {
                batch_index: i,
                measures: measures.len(),
                alignments: alignments.len(),
            })?;
            let total = accumulate(joined);
            Ok(PerplexityRecord {
                text: text.as_ref().to_string(),
                perplexity: total.perplexity(i)?,
                length: total.length,
            })
        })
        .collect()
}
