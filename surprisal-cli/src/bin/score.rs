//! Score texts with a language model
//!
//! Prints per-word, per-token or per-text predictability as tab-separated
//! tables and optionally saves the records as JSON.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use surprisal_engine::{
    Config, DevicePolicy, LanguageModel, Normalization, PerplexityRecord, Precision, TokenMeasure,
    WordPred,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Token and word predictability for a batch of texts
#[derive(Parser)]
#[command(name = "surprisal-score")]
struct Cli {
    /// File with one text per line ("-" reads stdin)
    input: Option<PathBuf>,

    /// Text to score (repeatable)
    #[arg(short, long = "text")]
    texts: Vec<String>,

    /// What to report
    #[arg(long, value_enum, default_value_t = Mode::Words)]
    mode: Mode,

    /// Configuration file (defaults to the user config file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Registry model family (e.g. gpt2)
    #[arg(long)]
    model: Option<String>,

    /// Direct GGUF file path (overrides --model)
    #[arg(long)]
    gguf: Option<PathBuf>,

    /// Path to tokenizer.json (required when using --gguf)
    #[arg(long)]
    tokenizer_json: Option<PathBuf>,

    /// full, half, int8 or int4
    #[arg(long, value_parser = parse_setting::<Precision>)]
    precision: Option<Precision>,

    /// best, cpu or gpu
    #[arg(long, value_parser = parse_setting::<DevicePolicy>)]
    device: Option<DevicePolicy>,

    /// none, nfc or nfkc
    #[arg(long, value_parser = parse_setting::<Normalization>)]
    normalization: Option<Normalization>,

    /// Context window size
    #[arg(long)]
    n_ctx: Option<u32>,

    /// Add the tokenizer's special tokens (BOS/CLS, EOS/SEP)
    #[arg(long)]
    add_special_tokens: bool,

    /// Texts per batch
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Save records to JSON
    #[arg(long)]
    output: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Words,
    Tokens,
    Perplexity,
}

/// Parse a lowercase configuration enum value the way the TOML file spells it.
fn parse_setting<T: DeserializeOwned>(value: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|e| e.to_string())
}

#[derive(Debug, Serialize)]
struct TokenRow {
    text_index: usize,
    position: usize,
    token: String,
    #[serde(flatten)]
    measure: TokenMeasure,
}

#[derive(Debug, Serialize)]
struct WordRow {
    text_index: usize,
    #[serde(flatten)]
    word: WordPred,
}

#[derive(Debug, Serialize)]
struct TextError {
    text_index: usize,
    error: String,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    model: String,
    tokenizer: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    words: Vec<WordRow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tokens: Vec<TokenRow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    perplexity: Vec<PerplexityRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<TextError>,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "surprisal_score=debug,surprisal_engine=debug"
    } else {
        "surprisal_score=info,surprisal_engine=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Configuration file merged with command line overrides.
fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load().context("Failed to load user config")?,
    };
    apply_overrides(&mut config, cli);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Command-line settings take precedence over the configuration file.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(model) = &cli.model {
        // A registry family replaces any local model from the file
        config.model.family = Some(model.clone());
        config.model.gguf = None;
        config.model.tokenizer_json = None;
    }
    if let Some(gguf) = &cli.gguf {
        config.model.gguf = Some(gguf.clone());
    }
    if let Some(tokenizer_json) = &cli.tokenizer_json {
        config.model.tokenizer_json = Some(tokenizer_json.clone());
    }
    if let Some(precision) = cli.precision {
        config.model.precision = precision;
    }
    if let Some(device) = cli.device {
        config.model.device = device;
    }
    if let Some(normalization) = cli.normalization {
        config.tokenizer.normalization = normalization;
    }
    if let Some(n_ctx) = cli.n_ctx {
        config.model.n_ctx = n_ctx;
    }
    if cli.add_special_tokens {
        config.scoring.add_special_tokens = true;
    }
}

fn read_texts(cli: &Cli) -> Result<Vec<String>> {
    let mut texts = cli.texts.clone();
    if let Some(path) = &cli.input {
        let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Box::new(BufReader::new(file))
        };
        for line in reader.lines() {
            let line = line.context("Failed to read input line")?;
            if !line.trim().is_empty() {
                texts.push(line);
            }
        }
    }
    Ok(texts)
}

fn progress_bar(len: usize, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let texts = read_texts(&cli)?;
    if texts.is_empty() {
        anyhow::bail!("no texts given; pass --text or an input file");
    }

    let config = build_config(&cli)?;
    let add_special_tokens = config.scoring.add_special_tokens;
    tracing::info!("Loading model '{}'...", config.model_name());
    let lm = LanguageModel::from_config(&config).context("Failed to load language model")?;

    let mut report = Report {
        model: lm.model_name().to_string(),
        tokenizer: lm.tokenizer_name().to_string(),
        ..Default::default()
    };

    let pb = progress_bar(texts.len(), cli.quiet)?;
    for (chunk_index, chunk) in texts.chunks(cli.batch_size.max(1)).enumerate() {
        let offset = chunk_index * cli.batch_size.max(1);
        let batch: Vec<&str> = chunk.iter().map(String::as_str).collect();
        match cli.mode {
            Mode::Words => {
                let results = lm
                    .each_word_predictabilities(&batch, add_special_tokens)
                    .with_context(|| format!("Failed to score texts {}..", offset + 1))?;
                for (i, result) in results.into_iter().enumerate() {
                    match result {
                        Ok(words) => report.words.extend(words.into_iter().map(|word| WordRow {
                            text_index: offset + i,
                            word,
                        })),
                        Err(e) => report.errors.push(TextError {
                            text_index: offset + i,
                            error: e.to_string(),
                        }),
                    }
                }
            }
            Mode::Tokens => {
                let measures = lm
                    .by_token_predictability(&batch, add_special_tokens)
                    .with_context(|| format!("Failed to score texts {}..", offset + 1))?;
                for (i, row) in measures.into_iter().enumerate() {
                    report
                        .tokens
                        .extend(row.into_iter().enumerate().map(|(position, measure)| TokenRow {
                            text_index: offset + i,
                            position,
                            token: lm
                                .tokenizer()
                                .id_to_token(measure.token_id)
                                .unwrap_or_default(),
                            measure,
                        }));
                }
            }
            Mode::Perplexity => {
                let results = lm
                    .each_perplexity(&batch, add_special_tokens)
                    .with_context(|| format!("Failed to score texts {}..", offset + 1))?;
                for (i, result) in results.into_iter().enumerate() {
                    match result {
                        Ok(record) => report.perplexity.push(record),
                        Err(e) => report.errors.push(TextError {
                            text_index: offset + i,
                            error: e.to_string(),
                        }),
                    }
                }
            }
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    print_report(&report, cli.mode);
    for error in &report.errors {
        tracing::warn!("text {}: {}", error.text_index + 1, error.error);
    }

    if let Some(output_path) = &cli.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(output_path, &json)
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
        eprintln!("Records saved to {}", output_path.display());
    }

    Ok(())
}

fn print_report(report: &Report, mode: Mode) {
    match mode {
        Mode::Words => {
            println!("text\tword\tsurprisal\tprobability\tis_split\tis_unk");
            for row in &report.words {
                let w = &row.word;
                println!(
                    "{}\t{}\t{:.4}\t{:.6e}\t{}\t{}",
                    row.text_index + 1,
                    w.word,
                    w.surp,
                    w.prob,
                    w.is_split,
                    w.is_unk
                );
            }
        }
        Mode::Tokens => {
            println!("text\tposition\ttoken\tid\tsurprisal\tprobability\tstatus");
            for row in &report.tokens {
                let m = &row.measure;
                println!(
                    "{}\t{}\t{}\t{}\t{:.4}\t{:.6e}\t{:?}",
                    row.text_index + 1,
                    row.position,
                    row.token,
                    m.token_id,
                    m.surprisal,
                    m.probability,
                    m.status
                );
            }
        }
        Mode::Perplexity => {
            println!("perplexity\tlength\ttext");
            for record in &report.perplexity {
                println!(
                    "{:.4}\t{}\t{}",
                    record.perplexity, record.length, record.text
                );
            }
        }
    }
}
