//! llama.cpp based GGUF inference
//!
//! Exposes a GGUF causal model as a [`LogitsModel`] returning one logits row
//! per input position.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::token::LlamaToken;
use tracing::{debug, info};

use crate::config::{DevicePolicy, ModelSettings};
use crate::error::{PredictError, Result};
use crate::predictor::LogitsModel;

/// Offload every layer when a GPU is used.
const ALL_LAYERS: u32 = 1000;

/// Global llama.cpp backend (can only be initialized once)
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// Get or initialize the global llama.cpp backend
fn get_backend() -> Result<&'static LlamaBackend> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(PredictError::ModelLoad(
            format!("Failed to initialize llama.cpp backend: {}", e).into(),
        )),
    }
}

/// Number of layers to offload for a device policy.
fn gpu_layers(device: DevicePolicy, gpu_available: bool) -> Result<u32> {
    match device {
        DevicePolicy::Cpu => Ok(0),
        DevicePolicy::Best if gpu_available => Ok(ALL_LAYERS),
        DevicePolicy::Best => Ok(0),
        DevicePolicy::Gpu if gpu_available => Ok(ALL_LAYERS),
        DevicePolicy::Gpu => Err(PredictError::config(
            "device = \"gpu\" but llama.cpp was built without GPU offload",
        )),
    }
}

/// llama.cpp causal model
pub struct LlamaCppModel {
    model: LlamaModel,
    name: String,
    vocab_size: usize,
    n_ctx: u32,
    /// Number of threads for inference (0 = use llama.cpp default)
    n_threads: u32,
}

impl LlamaCppModel {
    /// Load a GGUF model with the device, context and thread settings of
    /// `settings`; `name` identifies it in word records.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        name: impl Into<String>,
        settings: &ModelSettings,
    ) -> Result<Self> {
        let backend = get_backend()?;
        let n_gpu_layers = gpu_layers(settings.device, backend.supports_gpu_offload())?;
        let n_ctx = NonZeroU32::new(settings.n_ctx)
            .ok_or_else(|| PredictError::config("n_ctx must be non-zero"))?;

        // llama.cpp takes the element type and quantisation from the GGUF file;
        // the precision only picks the registry variant.
        let loader = settings.precision.loader_params();
        debug!(
            "Requested precision {:?}: dtype {:?}, quantization {:?}, low_cpu_mem_usage {}",
            settings.precision, loader.dtype, loader.quantization_bits, loader.low_cpu_mem_usage
        );

        let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        let model = LlamaModel::load_from_file(backend, path.as_ref(), &model_params)
            .map_err(|e| PredictError::ModelLoad(e.into()))?;
        let vocab_size = model.n_vocab() as usize;

        let name = name.into();
        info!(
            "Loaded {} from {:?} (vocab {}, n_ctx {}, gpu layers {})",
            name,
            path.as_ref(),
            vocab_size,
            n_ctx,
            n_gpu_layers
        );

        Ok(Self {
            model,
            name,
            vocab_size,
            n_ctx: n_ctx.get(),
            n_threads: settings.n_threads,
        })
    }

    pub fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    /// Context parameters sized so a full window is decoded in one batch.
    fn context_params(&self) -> LlamaContextParams {
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_batch(self.n_ctx)
            .with_n_ubatch(self.n_ctx);
        if self.n_threads > 0 {
            params
                .with_n_threads(self.n_threads as i32)
                .with_n_threads_batch(self.n_threads as i32)
        } else {
            params
        }
    }
}

impl LogitsModel for LlamaCppModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward(&self, input_ids: &[u32]) -> Result<Vec<f32>> {
        let n = input_ids.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > self.n_ctx as usize {
            return Err(PredictError::config(format!(
                "{} tokens exceed the context window of {}",
                n, self.n_ctx
            )));
        }

        let backend = get_backend()?;
        let mut ctx = self
            .model
            .new_context(backend, self.context_params())
            .map_err(|e| PredictError::Inference(e.into()))?;

        let tokens: Vec<LlamaToken> = input_ids.iter().map(|&id| LlamaToken(id as i32)).collect();
        let mut batch = LlamaBatch::new(n, 1);
        batch
            .add_sequence(&tokens, 0, true)
            .map_err(|e| PredictError::Inference(e.into()))?;
        ctx.decode(&mut batch)
            .map_err(|e| PredictError::Inference(e.into()))?;

        let mut logits = Vec::with_capacity(n * self.vocab_size);
        for pos in 0..n {
            let row = ctx.get_logits_ith(pos as i32);
            logits.extend_from_slice(&row[..self.vocab_size]);
        }
        debug!("{}: decoded {} positions", self.name, n);
        Ok(logits)
    }
}
