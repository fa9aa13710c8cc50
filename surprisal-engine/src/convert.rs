//! Logits to probability and surprisal conversion.
//!
//! All conversions run in the log domain: the row maximum is subtracted
//! before exponentiating, and surprisal is `-log2(p)` derived from the
//! log-probability rather than from `p` itself.

use crate::error::{PredictError, Result};
use crate::measure::TokenMeasure;

/// Shape of a flat row-major `[batch, sequence, vocab]` logits buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogitsShape {
    pub batch: usize,
    pub sequence: usize,
    pub vocab: usize,
}

impl LogitsShape {
    pub fn new(batch: usize, sequence: usize, vocab: usize) -> Self {
        Self {
            batch,
            sequence,
            vocab,
        }
    }

    /// Total number of values in a buffer of this shape.
    pub fn numel(&self) -> usize {
        self.batch * self.sequence * self.vocab
    }

    fn row_offset(&self, batch_index: usize, position: usize) -> usize {
        (batch_index * self.sequence + position) * self.vocab
    }
}

/// Normalised distributions for every position of a batch.
#[derive(Debug, Clone)]
pub struct Predictability {
    shape: LogitsShape,
    probabilities: Vec<f64>,
    surprisals: Vec<f64>,
}

impl Predictability {
    pub fn shape(&self) -> LogitsShape {
        self.shape
    }

    /// Probability distribution at `(batch_index, position)`.
    pub fn probabilities(&self, batch_index: usize, position: usize) -> &[f64] {
        let start = self.shape.row_offset(batch_index, position);
        &self.probabilities[start..start + self.shape.vocab]
    }

    /// Surprisal (bits) of every vocabulary entry at `(batch_index, position)`.
    pub fn surprisals(&self, batch_index: usize, position: usize) -> &[f64] {
        let start = self.shape.row_offset(batch_index, position);
        &self.surprisals[start..start + self.shape.vocab]
    }
}

/// Log-softmax (natural log) of a single logits row.
///
/// The row must be finite; use [`token_measure`] or
/// [`convert_to_predictability`] for checked conversion.
pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max) as f64;
    let log_sum_exp = logits
        .iter()
        .map(|&x| (x as f64 - max_logit).exp())
        .sum::<f64>()
        .ln()
        + max_logit;
    logits.iter().map(|&x| x as f64 - log_sum_exp).collect()
}

fn check_row(logits: &[f32], batch_index: usize, position: usize) -> Result<()> {
    if logits.is_empty() {
        return Err(PredictError::config("logits row has an empty vocabulary"));
    }
    match logits.iter().find(|x| !x.is_finite()) {
        Some(&value) => Err(PredictError::Numeric {
            batch_index,
            position,
            value,
        }),
        None => Ok(()),
    }
}

/// Scored measure of `token_id` under one logits row.
pub fn token_measure(
    logits: &[f32],
    token_id: u32,
    batch_index: usize,
    position: usize,
) -> Result<TokenMeasure> {
    check_row(logits, batch_index, position)?;
    let target = token_id as usize;
    if target >= logits.len() {
        return Err(PredictError::config(format!(
            "token id {} outside vocabulary of {}",
            token_id,
            logits.len()
        )));
    }
    let log_probs = log_softmax(logits);
    Ok(TokenMeasure::from_log_prob(token_id, log_probs[target]))
}

/// Convert a `[batch, sequence, vocab]` logits buffer into probabilities and
/// base-2 surprisals for every vocabulary entry.
pub fn convert_to_predictability(logits: &[f32], shape: LogitsShape) -> Result<Predictability> {
    if logits.len() != shape.numel() {
        return Err(PredictError::config(format!(
            "logits buffer holds {} values, shape {:?} needs {}",
            logits.len(),
            shape,
            shape.numel()
        )));
    }

    let mut probabilities = Vec::with_capacity(logits.len());
    let mut surprisals = Vec::with_capacity(logits.len());

    for batch_index in 0..shape.batch {
        for position in 0..shape.sequence {
            let start = shape.row_offset(batch_index, position);
            let row = &logits[start..start + shape.vocab];
            check_row(row, batch_index, position)?;
            for lp in log_softmax(row) {
                probabilities.push(lp.exp());
                surprisals.push(-lp / std::f64::consts::LN_2);
            }
        }
    }

    Ok(Predictability {
        shape,
        probabilities,
        surprisals,
    })
}
