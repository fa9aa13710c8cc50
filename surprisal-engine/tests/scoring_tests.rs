//! End-to-end scoring through a real `tokenizers` pipeline
//!
//! A small WordPiece `tokenizer.json` is built in memory; the numeric model
//! is a deterministic stand-in so expected values can be computed by hand.

use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use surprisal_engine::config::{ScoringSettings, TokenizerConfig};
use surprisal_engine::{
    Architecture, Config, HfTokenizer, LanguageModel, LogitsModel, Normalization, PllPolicy,
    PredictError, TokenStatus, Tokenizer,
};

const VOCAB: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "cat", "sat", ".", "un", "##believ",
    "##able", "on", "mat",
];

fn tokenizer_json() -> String {
    let added: Vec<String> = VOCAB[..5]
        .iter()
        .enumerate()
        .map(|(id, token)| {
            format!(
                r#"{{"id":{id},"content":"{token}","single_word":false,"lstrip":false,"rstrip":false,"normalized":false,"special":true}}"#
            )
        })
        .collect();
    let vocab: Vec<String> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, token)| format!(r#""{token}":{id}"#))
        .collect();
    format!(
        r###"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [{added}],
  "normalizer": {{"type": "BertNormalizer", "clean_text": true, "handle_chinese_chars": true, "strip_accents": null, "lowercase": true}},
  "pre_tokenizer": {{"type": "BertPreTokenizer"}},
  "post_processor": {{"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]}},
  "decoder": {{"type": "WordPiece", "prefix": "##", "cleanup": true}},
  "model": {{"type": "WordPiece", "unk_token": "[UNK]", "continuing_subword_prefix": "##", "max_input_chars_per_word": 100, "vocab": {{{vocab}}}}}
}}"###,
        added = added.join(","),
        vocab = vocab.join(","),
    )
}

fn tokenizer_config() -> TokenizerConfig {
    TokenizerConfig {
        name: Some("tiny-wordpiece".to_string()),
        pad_token: Some("[PAD]".to_string()),
        model_max_length: 32,
        ..Default::default()
    }
}

fn hf_tokenizer(config: &TokenizerConfig) -> HfTokenizer {
    let inner = tokenizers::Tokenizer::from_str(&tokenizer_json()).unwrap();
    HfTokenizer::from_tokenizer(inner, config).unwrap()
}

/// Every position gets the same all-zero row: a uniform distribution.
struct UniformModel;

impl LogitsModel for UniformModel {
    fn name(&self) -> &str {
        "uniform"
    }

    fn vocab_size(&self) -> usize {
        VOCAB.len()
    }

    fn forward(&self, input_ids: &[u32]) -> surprisal_engine::Result<Vec<f32>> {
        Ok(vec![0.0; input_ids.len() * VOCAB.len()])
    }
}

fn scoring(architecture: Architecture, pll: PllPolicy) -> ScoringSettings {
    ScoringSettings {
        architecture,
        pll,
        add_special_tokens: false,
    }
}

fn causal_lm() -> LanguageModel {
    LanguageModel::new(
        UniformModel,
        Arc::new(hf_tokenizer(&tokenizer_config())),
        &scoring(Architecture::Causal, PllPolicy::Original),
    )
    .unwrap()
}

fn uniform_p() -> f64 {
    1.0 / VOCAB.len() as f64
}

#[test]
fn test_alignment_from_wordpiece() {
    let tokenizer = hf_tokenizer(&tokenizer_config());
    let alignments = tokenizer
        .align_words_ids(&["The unbelievable cat."], true)
        .unwrap();
    let a = &alignments[0];
    // [CLS] the un ##believ ##able cat . [SEP]
    assert_eq!(
        a.mapping_to_words,
        vec![None, Some(0), Some(1), Some(1), Some(1), Some(2), Some(3), None]
    );
    let words: Vec<_> = a.words.iter().map(|w| w.as_deref().unwrap()).collect();
    assert_eq!(words, vec!["The", "unbelievable", "cat", "."]);
}

#[test]
fn test_causal_words_match_alignment() {
    let lm = causal_lm();
    let words = lm.word_predictabilities(&["The cat sat."], false).unwrap();
    let words = &words[0];
    assert_eq!(words.len(), 4);
    assert_eq!(words[0].word, "The");
    assert_eq!(words[0].prob, 1.0);
    for w in &words[1..] {
        assert!((w.prob - uniform_p()).abs() < 1e-9);
        assert!((w.surp - (VOCAB.len() as f64).log2()).abs() < 1e-9);
        assert!(!w.is_split);
        assert!(!w.is_unk);
        assert_eq!(w.model_name, "uniform");
        assert_eq!(w.tokenizer_name, "tiny-wordpiece");
    }
}

#[test]
fn test_split_word_joint_probability() {
    let lm = causal_lm();
    let words = lm
        .word_predictabilities(&["the unbelievable cat"], false)
        .unwrap();
    let w = &words[0][1];
    assert_eq!(w.word, "unbelievable");
    assert!(w.is_split);
    assert!((w.prob - uniform_p().powi(3)).abs() < 1e-12);
    assert!((w.surp - 3.0 * (VOCAB.len() as f64).log2()).abs() < 1e-9);
}

#[test]
fn test_unknown_word_flagged() {
    let lm = causal_lm();
    let words = lm.word_predictabilities(&["the dog sat"], false).unwrap();
    let flags: Vec<bool> = words[0].iter().map(|w| w.is_unk).collect();
    assert_eq!(flags, vec![false, true, false]);
}

#[test]
fn test_unknown_token_declared_by_model() {
    // Same vocabulary, but the unknown token is spelled `<UNK>`
    let json = tokenizer_json().replace("[UNK]", "<UNK>");
    let inner = tokenizers::Tokenizer::from_str(&json).unwrap();
    let tokenizer = HfTokenizer::from_tokenizer(inner, &tokenizer_config()).unwrap();
    assert!(tokenizer.is_unk_token_id(1));

    let lm = LanguageModel::new(
        UniformModel,
        Arc::new(tokenizer),
        &scoring(Architecture::Causal, PllPolicy::Original),
    )
    .unwrap();
    let words = lm.word_predictabilities(&["the dog"], false).unwrap();
    let flags: Vec<bool> = words[0].iter().map(|w| w.is_unk).collect();
    assert_eq!(flags, vec![false, true]);
}

#[test]
fn test_configured_unknown_token_overrides_model() {
    let config = TokenizerConfig {
        unk_token: Some("[MASK]".to_string()),
        ..tokenizer_config()
    };
    let tokenizer = hf_tokenizer(&config);
    assert!(tokenizer.is_unk_token_id(4));
    assert!(!tokenizer.is_unk_token_id(1));
}

#[test]
fn test_declared_unknown_token_missing_from_vocab_is_rejected() {
    let json = tokenizer_json().replace(r#""unk_token": "[UNK]""#, r#""unk_token": "<missing>""#);
    let inner = tokenizers::Tokenizer::from_str(&json).unwrap();
    let err = HfTokenizer::from_tokenizer(inner, &tokenizer_config()).err().unwrap();
    assert!(matches!(err, PredictError::Configuration(_)));
}

#[test]
fn test_bpe_without_unknown_token_flags_nothing() {
    let json = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {"type": "BPE", "dropout": null, "unk_token": null, "continuing_subword_prefix": null, "end_of_word_suffix": null, "fuse_unk": false, "byte_fallback": false, "vocab": {"a": 0, "b": 1, "ab": 2}, "merges": ["a b"]}
}"#;
    let inner = tokenizers::Tokenizer::from_str(json).unwrap();
    let tokenizer = HfTokenizer::from_tokenizer(inner, &TokenizerConfig::default()).unwrap();
    assert!((0..3).all(|id| !tokenizer.is_unk_token_id(id)));
}

#[test]
fn test_uniform_perplexity_is_vocab_size() {
    let lm = causal_lm();
    let ppl = lm
        .batch_perplexity(&["The cat sat.", "the cat sat on the mat"], false)
        .unwrap();
    assert_eq!(ppl[0].text, "The cat sat.");
    assert_eq!(ppl[0].length, 3);
    assert_eq!(ppl[1].length, 5);
    for record in &ppl {
        assert!((record.perplexity - VOCAB.len() as f64).abs() < 1e-6);
    }
}

#[test]
fn test_padded_batch_keeps_per_text_lengths() {
    let lm = causal_lm();
    let texts = ["the cat", "the cat sat on the mat"];
    let measures = lm.by_token_predictability(&texts, true).unwrap();
    let alignments = lm.tokenizer().align_words_ids(&texts, true).unwrap();
    assert_eq!(measures[0].len(), measures[1].len());
    for (m, a) in measures.iter().zip(&alignments) {
        assert_eq!(m.len(), a.len());
    }
    // [CLS] the cat [SEP] then padding
    assert!(measures[0][4..].iter().all(|m| m.status == TokenStatus::Special));

    let words = lm.word_predictabilities(&texts, true).unwrap();
    assert_eq!(words[0].len(), 2);
    assert_eq!(words[1].len(), 6);
}

#[test]
fn test_masked_modified_scores_every_word() {
    let lm = LanguageModel::new(
        UniformModel,
        Arc::new(hf_tokenizer(&tokenizer_config())),
        &scoring(Architecture::Masked, PllPolicy::Modified),
    )
    .unwrap();
    for add_special_tokens in [false, true] {
        let words = lm
            .word_predictabilities(&["the unbelievable cat"], add_special_tokens)
            .unwrap();
        assert_eq!(words[0].len(), 3);
        assert!((words[0][0].prob - uniform_p()).abs() < 1e-9);
        assert!(words[0][1].is_split);
    }
    let ppl = lm.batch_perplexity(&["the cat"], false).unwrap();
    assert_eq!(ppl[0].length, 2);
}

#[test]
fn test_nfkc_normalization_avoids_unknown_tokens() {
    let texts = ["ｔｈｅ ｃａｔ"];

    let plain = causal_lm();
    let words = plain.word_predictabilities(&texts, false).unwrap();
    assert!(words[0].iter().all(|w| w.is_unk));

    let config = TokenizerConfig {
        normalization: Normalization::Nfkc,
        ..tokenizer_config()
    };
    let lm = LanguageModel::new(
        UniformModel,
        Arc::new(hf_tokenizer(&config)),
        &scoring(Architecture::Causal, PllPolicy::Original),
    )
    .unwrap();
    let words = lm.word_predictabilities(&texts, false).unwrap();
    let surface: Vec<_> = words[0].iter().map(|w| w.word.as_str()).collect();
    assert_eq!(surface, vec!["the", "cat"]);
    assert!(words[0].iter().all(|w| !w.is_unk));
}

#[test]
fn test_text_longer_than_model_max_length_is_rejected() {
    let config = TokenizerConfig {
        model_max_length: 3,
        ..tokenizer_config()
    };
    let tokenizer = hf_tokenizer(&config);
    let err = tokenizer
        .encode_batch(&["the cat", "the cat sat on the mat"], false)
        .unwrap_err();
    assert!(matches!(err, PredictError::Configuration(_)));
}

#[test]
fn test_padding_without_pad_token_is_rejected() {
    let config = TokenizerConfig {
        pad_token: None,
        ..tokenizer_config()
    };
    let tokenizer = hf_tokenizer(&config);
    assert!(tokenizer.encode_batch(&["the cat", "the cat"], false).is_ok());
    let err = tokenizer
        .encode_batch(&["the cat", "the cat sat"], false)
        .unwrap_err();
    assert!(matches!(err, PredictError::Configuration(_)));
}

#[test]
fn test_missing_configured_token_is_rejected() {
    let config = TokenizerConfig {
        unk_token: Some("<unk>".to_string()),
        ..tokenizer_config()
    };
    let inner = tokenizers::Tokenizer::from_str(&tokenizer_json()).unwrap();
    let err = HfTokenizer::from_tokenizer(inner, &config).err().unwrap();
    assert!(matches!(err, PredictError::Configuration(_)));
}

#[test]
fn test_scoring_settings_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[scoring]
architecture = "masked"
pll = "modified"

[tokenizer]
pad_token = "[PAD]"
model_max_length = 16
"#
    )
    .unwrap();
    let config = Config::load_from(file.path()).unwrap();
    assert_eq!(config.scoring.architecture, Architecture::Masked);

    let lm = LanguageModel::new(
        UniformModel,
        Arc::new(hf_tokenizer(&config.tokenizer)),
        &config.scoring,
    )
    .unwrap();
    let words = lm.word_predictabilities(&["the cat sat"], false).unwrap();
    assert_eq!(words[0].len(), 3);

    // llama.cpp has no masked head
    assert!(matches!(
        LanguageModel::from_config(&config),
        Err(PredictError::Configuration(_))
    ));
}
