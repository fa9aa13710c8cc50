//! Language model facade: one predictor and one aligner over a shared
//! tokenizer.

use std::sync::Arc;

use tracing::debug;

use crate::config::{Architecture, Config, ScoringSettings};
use crate::error::{PredictError, Result};
use crate::measure::{AlignmentRecord, PerplexityRecord, TokenMeasure, WordPred};
use crate::model;
use crate::perplexity;
use crate::predictor::{ByTokenPredictor, LogitsModel, build_predictor};
use crate::tokenizer::Tokenizer;
use crate::words::WordAggregator;

/// Token, word and sequence predictability for one model.
pub struct LanguageModel {
    predictor: Box<dyn ByTokenPredictor>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl LanguageModel {
    /// Build around a numeric kernel; the predictor is chosen from the
    /// scoring architecture.
    pub fn new<M>(model: M, tokenizer: Arc<dyn Tokenizer>, scoring: &ScoringSettings) -> Result<Self>
    where
        M: LogitsModel + 'static,
    {
        let predictor = build_predictor(scoring.architecture, scoring.pll, model, tokenizer.clone())?;
        Ok(Self::from_parts(predictor, tokenizer))
    }

    pub fn from_parts(predictor: Box<dyn ByTokenPredictor>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            predictor,
            tokenizer,
        }
    }

    /// Load the configured GGUF model and tokenizer.
    ///
    /// llama.cpp exposes no masked-language-model head, so only causal
    /// scoring can be loaded this way.
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.scoring.architecture == Architecture::Masked {
            return Err(PredictError::config(
                "GGUF models are scored causally; build a masked LanguageModel from a LogitsModel instead",
            ));
        }
        let (model, tokenizer) = model::load(config)?;
        Self::new(model, Arc::new(tokenizer), &config.scoring)
    }

    pub fn model_name(&self) -> &str {
        self.predictor.model_name()
    }

    pub fn tokenizer_name(&self) -> &str {
        self.tokenizer.name()
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// One measure per token position of every text.
    pub fn by_token_predictability(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Vec<TokenMeasure>>> {
        self.predictor
            .by_token_predictability(texts, add_special_tokens)
    }

    fn measure_and_align(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<(Vec<Vec<TokenMeasure>>, Vec<AlignmentRecord>)> {
        let measures = self.by_token_predictability(texts, add_special_tokens)?;
        let alignments = self.tokenizer.align_words_ids(texts, add_special_tokens)?;
        debug!(
            "{} texts: {} measure sequences, {} alignments",
            texts.len(),
            measures.len(),
            alignments.len()
        );
        Ok((measures, alignments))
    }

    fn aggregator(&self) -> WordAggregator<impl Fn(u32) -> bool + '_> {
        WordAggregator::new(self.model_name(), self.tokenizer_name(), |id| {
            self.tokenizer.is_unk_token_id(id)
        })
    }

    /// Word-level predictability; any failing text fails the batch.
    pub fn word_predictabilities(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Vec<WordPred>>> {
        let (measures, alignments) = self.measure_and_align(texts, add_special_tokens)?;
        self.aggregator().aggregate(&measures, &alignments)
    }

    /// Word-level predictability with one result per text.
    ///
    /// The outer error covers failures of the batch as a whole (tokenizing,
    /// inference); alignment failures stay with their text.
    pub fn each_word_predictabilities(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Result<Vec<WordPred>>>> {
        let (measures, alignments) = self.measure_and_align(texts, add_special_tokens)?;
        Ok(self.aggregator().aggregate_each(&measures, &alignments))
    }

    /// Perplexity of every text; any failing text fails the batch.
    pub fn batch_perplexity(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<PerplexityRecord>> {
        let (measures, alignments) = self.measure_and_align(texts, add_special_tokens)?;
        perplexity::batch_perplexity(texts, &measures, &alignments)
    }

    /// Perplexity with one result per text.
    pub fn each_perplexity(
        &self,
        texts: &[&str],
        add_special_tokens: bool,
    ) -> Result<Vec<Result<PerplexityRecord>>> {
        let (measures, alignments) = self.measure_and_align(texts, add_special_tokens)?;
        Ok(perplexity::each_perplexity(texts, &measures, &alignments))
    }
}
