use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use surprisal_engine::{
    Config, LanguageModel, PerplexityRecord, PredictError, TokenStatus, WordPred, registry,
};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Surprisal scoring server
#[derive(Parser, Debug)]
#[command(name = "surprisal-server")]
#[command(about = "Token and word predictability over HTTP", long_about = None)]
struct Args {
    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Load every registry family instead of the configured model
    #[arg(long)]
    all_models: bool,

    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[derive(Clone)]
struct LoadedModel {
    lm: Arc<LanguageModel>,
    display_name: String,
}

#[derive(Clone)]
struct AppState {
    /// Loaded models keyed by model id (family name or GGUF stem)
    models: Arc<RwLock<HashMap<String, LoadedModel>>>,
    default_model: String,
    add_special_tokens: bool,
}

#[derive(Debug, Deserialize)]
struct ScoreRequest {
    texts: Vec<String>,
    /// Model to use (optional, uses default if not specified)
    #[serde(default)]
    model: Option<String>,
    /// Overrides the configured `scoring.add_special_tokens`
    #[serde(default)]
    add_special_tokens: Option<bool>,
}

/// Per-text outcome: the records, or why this text failed
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TextResult<T> {
    Ok(T),
    Err { error: String },
}

impl<T> From<surprisal_engine::Result<T>> for TextResult<T> {
    fn from(result: surprisal_engine::Result<T>) -> Self {
        match result {
            Ok(value) => TextResult::Ok(value),
            Err(e) => TextResult::Err {
                error: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WordsResponse {
    model: String,
    tokenizer: String,
    results: Vec<TextResult<Vec<WordPred>>>,
}

#[derive(Debug, Serialize)]
struct PerplexityResponse {
    model: String,
    results: Vec<TextResult<PerplexityRecord>>,
}

#[derive(Debug, Serialize)]
struct TokenInfo {
    id: u32,
    text: String,
    probability: f64,
    surprisal: f64,
    status: TokenStatus,
}

#[derive(Debug, Serialize)]
struct TokensResponse {
    model: String,
    tokens: Vec<Vec<TokenInfo>>,
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    id: String,
    name: String,
    tokenizer: String,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
    default: String,
}

type ApiError = (StatusCode, String);

fn api_error(e: PredictError) -> ApiError {
    let status = match e {
        PredictError::Configuration(_) | PredictError::UnknownVariant(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!("Scoring failed: {}", e);
    (status, e.to_string())
}

/// Configurations to load: every registry family, or the configured model.
fn model_configs(base: &Config, all_models: bool) -> Vec<(String, Config)> {
    if !all_models || base.model.gguf.is_some() {
        return vec![(base.model_name(), base.clone())];
    }
    registry()
        .models
        .iter()
        .map(|(name, family)| {
            let mut config = base.clone();
            config.model.family = Some(name.clone());
            config.model.name = None;
            if let Some(n_ctx) = family.n_ctx {
                config.model.n_ctx = config.model.n_ctx.min(n_ctx);
            }
            (name.clone(), config)
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Default: info level, with --verbose: debug level
    let default_filter = if args.verbose {
        "surprisal_server=debug,surprisal_engine=debug,tower_http=debug"
    } else {
        "surprisal_server=info,surprisal_engine=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .expect("failed to load configuration");

    let mut models = HashMap::new();
    for (model_id, model_config) in model_configs(&config, args.all_models) {
        let display_name = model_config
            .model
            .family
            .as_deref()
            .and_then(|f| registry().family(f))
            .filter(|_| model_config.model.gguf.is_none())
            .map_or_else(|| model_id.clone(), |f| f.display_name.clone());

        tracing::info!("Loading model '{}'...", model_id);
        match LanguageModel::from_config(&model_config) {
            Ok(lm) => {
                tracing::info!("Model '{}' loaded successfully", model_id);
                models.insert(
                    model_id,
                    LoadedModel {
                        lm: Arc::new(lm),
                        display_name,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load model '{}': {}. Set HF_TOKEN for private repos.",
                    model_id,
                    e
                );
            }
        }
    }

    if models.is_empty() {
        tracing::warn!("No models loaded; scoring endpoints will return 503");
    } else {
        tracing::info!("Loaded {} model(s)", models.len());
    }

    let default_model = if models.contains_key(&config.model_name()) {
        config.model_name()
    } else {
        models.keys().min().cloned().unwrap_or_default()
    };

    let state = AppState {
        models: Arc::new(RwLock::new(models)),
        default_model,
        add_special_tokens: config.scoring.add_special_tokens,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/words", post(words_handler))
        .route("/api/perplexity", post(perplexity_handler))
        .route("/api/tokens", post(tokens_handler))
        .route("/api/models", get(models_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(cors)
        .with_state(state);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind server address");

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .await
        .expect("failed to run server");
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "surprisal-engine"
    }))
}

async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    let loaded = state.models.read().expect("lock poisoned");

    let mut models: Vec<ModelInfo> = loaded
        .iter()
        .map(|(model_id, info)| ModelInfo {
            id: model_id.clone(),
            name: info.display_name.clone(),
            tokenizer: info.lm.tokenizer_name().to_string(),
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));

    Json(ModelsResponse {
        models,
        default: state.default_model.clone(),
    })
}

/// Pick the requested or default model.
fn select_model(state: &AppState, requested: Option<&str>) -> Result<Arc<LanguageModel>, ApiError> {
    let loaded = state.models.read().expect("lock poisoned");
    let model_id = requested.unwrap_or(state.default_model.as_str());
    if loaded.is_empty() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "No models loaded".to_string(),
        ));
    }
    loaded
        .get(model_id)
        .map(|info| info.lm.clone())
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("model '{}' not loaded", model_id)))
}

/// Run a scoring closure off the async runtime.
async fn score<T, F>(
    state: &AppState,
    req: ScoreRequest,
    f: F,
) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&LanguageModel, &[&str], bool) -> surprisal_engine::Result<T> + Send + 'static,
{
    let lm = select_model(state, req.model.as_deref())?;
    let add_special_tokens = req.add_special_tokens.unwrap_or(state.add_special_tokens);
    let texts = req.texts;
    tracing::debug!("Scoring {} texts with '{}'", texts.len(), lm.model_name());

    let start = std::time::Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        f(&lm, &refs, add_special_tokens)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(api_error)?;
    tracing::debug!("Scored in {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);
    Ok(result)
}

async fn words_handler(
    State(state): State<AppState>,
    Json(req): Json<ScoreRequest>,
) -> Result<Json<WordsResponse>, ApiError> {
    score(&state, req, |lm, texts, add_special_tokens| {
        let results = lm.each_word_predictabilities(texts, add_special_tokens)?;
        Ok(WordsResponse {
            model: lm.model_name().to_string(),
            tokenizer: lm.tokenizer_name().to_string(),
            results: results.into_iter().map(TextResult::from).collect(),
        })
    })
    .await
    .map(Json)
}

async fn perplexity_handler(
    State(state): State<AppState>,
    Json(req): Json<ScoreRequest>,
) -> Result<Json<PerplexityResponse>, ApiError> {
    score(&state, req, |lm, texts, add_special_tokens| {
        let results = lm.each_perplexity(texts, add_special_tokens)?;
        Ok(PerplexityResponse {
            model: lm.model_name().to_string(),
            results: results.into_iter().map(TextResult::from).collect(),
        })
    })
    .await
    .map(Json)
}

async fn tokens_handler(
    State(state): State<AppState>,
    Json(req): Json<ScoreRequest>,
) -> Result<Json<TokensResponse>, ApiError> {
    score(&state, req, |lm, texts, add_special_tokens| {
        let measures = lm.by_token_predictability(texts, add_special_tokens)?;
        let tokenizer = lm.tokenizer();
        let tokens = measures
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|m| TokenInfo {
                        id: m.token_id,
                        text: tokenizer
                            .id_to_token(m.token_id)
                            .unwrap_or_else(|| "<??>".to_string()),
                        probability: m.probability,
                        surprisal: m.surprisal,
                        status: m.status,
                    })
                    .collect()
            })
            .collect();
        Ok(TokensResponse {
            model: lm.model_name().to_string(),
            tokens,
        })
    })
    .await
    .map(Json)
}
