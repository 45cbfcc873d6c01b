//! Full-precision runner on candle
//!
//! Loads `tokenizer.json`, `config.json` and safetensors weights from a model
//! directory and samples token by token. Chat requests are flattened to a
//! `Role: content` transcript ending in `Assistant:`; no model-specific chat
//! template is applied.

use super::backend::{time_seed, Backend, BackendError, LoadOptions};
use crate::system::gpu;
use crate::types::config::TuningProfile;
use crate::types::message::{flatten_chat, ChatMessage};
use crate::types::model::{BackendKind, DeviceInfo};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{llama, qwen2};
use candle_transformers::utils::apply_repeat_penalty;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Tokens that end generation when the tokenizer knows them
const EOS_CANDIDATES: [&str; 5] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<|end|>"];

/// Window of recent tokens the repetition penalty looks at
const REPEAT_LAST_N: usize = 64;

/// Used when `config.json` does not state `max_position_embeddings`
const DEFAULT_MAX_CONTEXT: usize = 4096;

fn load_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Load(e.to_string())
}

fn gen_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Generation(e.to_string())
}

enum Arch {
    Llama {
        model: llama::Llama,
        config: llama::Config,
        cache: llama::Cache,
    },
    Qwen2(qwen2::ModelForCausalLM),
}

impl Arch {
    /// Start a fresh sequence
    fn reset(&mut self, dtype: DType, device: &Device) -> Result<(), BackendError> {
        match self {
            Arch::Llama { config, cache, .. } => {
                *cache = llama::Cache::new(true, dtype, config, device).map_err(gen_err)?;
            }
            Arch::Qwen2(model) => model.clear_kv_cache(),
        }
        Ok(())
    }

    /// Logits for the last position as a flat f32 vector
    fn forward(&mut self, input: &Tensor, pos: usize) -> Result<Tensor, BackendError> {
        let logits = match self {
            Arch::Llama { model, cache, .. } => model.forward(input, pos, cache),
            Arch::Qwen2(model) => model.forward(input, pos),
        }
        .map_err(gen_err)?;
        logits
            .flatten_all()
            .and_then(|l| l.to_dtype(DType::F32))
            .map_err(gen_err)
    }
}

struct Loaded {
    arch: Arch,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos: Vec<u32>,
    max_context: usize,
    path: PathBuf,
}

pub struct CandleBackend {
    loaded: Option<Loaded>,
}

impl CandleBackend {
    pub fn new() -> Self {
        Self { loaded: None }
    }

    fn load_dir(dir: &Path) -> Result<Loaded, BackendError> {
        let tokenizer_path = dir.join("tokenizer.json");
        let config_path = dir.join("config.json");
        for required in [&tokenizer_path, &config_path] {
            if !required.exists() {
                return Err(BackendError::NotFound(required.display().to_string()));
            }
        }

        let pattern = format!("{}/*.safetensors", glob::Pattern::escape(&dir.to_string_lossy()));
        let mut weights: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(load_err)?
            .filter_map(|p| p.ok())
            .collect();
        weights.sort();
        if weights.is_empty() {
            return Err(BackendError::NotFound(format!(
                "no .safetensors weights in {}",
                dir.display()
            )));
        }

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(load_err)?;
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&config_path).map_err(load_err)?)
                .map_err(load_err)?;
        let model_type = raw["model_type"].as_str().unwrap_or("llama").to_string();
        let max_context = raw["max_position_embeddings"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CONTEXT);

        let device = Device::cuda_if_available(0).map_err(load_err)?;
        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        tracing::info!(
            path = %dir.display(),
            model_type = %model_type,
            files = weights.len(),
            cuda = device.is_cuda(),
            "Loading safetensors model"
        );

        // SAFETY: the weight files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights.as_slice(), dtype, &device) }
            .map_err(load_err)?;

        let arch = match model_type.as_str() {
            "llama" | "mistral" => {
                let cfg: llama::LlamaConfig = serde_json::from_value(raw).map_err(load_err)?;
                let config = cfg.into_config(false);
                let model = llama::Llama::load(vb, &config).map_err(load_err)?;
                let cache = llama::Cache::new(true, dtype, &config, &device).map_err(load_err)?;
                Arch::Llama {
                    model,
                    config,
                    cache,
                }
            }
            "qwen2" => {
                let config: qwen2::Config = serde_json::from_value(raw).map_err(load_err)?;
                Arch::Qwen2(qwen2::ModelForCausalLM::new(&config, vb).map_err(load_err)?)
            }
            other => {
                return Err(BackendError::Unsupported(format!(
                    "architecture {:?} is not supported by the transformers backend",
                    other
                )))
            }
        };

        let eos = EOS_CANDIDATES
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        Ok(Loaded {
            arch,
            max_context,
            tokenizer,
            device,
            dtype,
            eos,
            path: dir.to_path_buf(),
        })
    }
}

impl Default for CandleBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn sampling(params: &TuningProfile) -> Sampling {
    if !params.do_sample || params.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    Sampling::TopKThenTopP {
        k: params.top_k.max(1) as usize,
        p: params.top_p as f64,
        temperature: params.temperature as f64,
    }
}

impl Backend for CandleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Transformers
    }

    fn load(&mut self, path: &Path, _options: &LoadOptions) -> Result<(), BackendError> {
        self.unload();

        let dir = if path.is_file() {
            path.parent().unwrap_or(path)
        } else {
            path
        };
        if !dir.is_dir() {
            return Err(BackendError::NotFound(path.display().to_string()));
        }

        self.loaded = Some(Self::load_dir(dir)?);
        Ok(())
    }

    fn unload(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            tracing::info!(path = %loaded.path.display(), "Unloading safetensors model");
            // Dropping the weights and KV cache releases device memory
            drop(loaded);
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn device_info(&self) -> DeviceInfo {
        match &self.loaded {
            Some(loaded) if loaded.device.is_cuda() => gpu::device_info(),
            _ => DeviceInfo::cpu(),
        }
    }

    fn generate(&mut self, prompt: &str, params: &TuningProfile) -> Result<String, BackendError> {
        let loaded = self.loaded.as_mut().ok_or(BackendError::NotLoaded)?;
        loaded.arch.reset(loaded.dtype, &loaded.device)?;

        let encoding = loaded.tokenizer.encode(prompt, true).map_err(gen_err)?;
        let mut context: Vec<u32> = encoding.get_ids().to_vec();
        if context.is_empty() {
            return Err(BackendError::Generation("prompt produced no tokens".to_string()));
        }
        if context.len() >= loaded.max_context {
            return Err(BackendError::Generation(format!(
                "prompt is {} tokens, context window is {}",
                context.len(),
                loaded.max_context
            )));
        }

        let mut processor = LogitsProcessor::from_sampling(time_seed(), sampling(params));
        let mut generated: Vec<u32> = Vec::new();
        let mut input = context.clone();
        let mut pos = 0usize;

        for _ in 0..params.max_tokens {
            if pos + input.len() > loaded.max_context {
                tracing::warn!("Context window full, stopping generation");
                break;
            }
            let tensor = Tensor::new(input.as_slice(), &loaded.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(gen_err)?;
            let mut logits = loaded.arch.forward(&tensor, pos)?;
            pos += input.len();

            if params.repetition_penalty != 1.0 {
                let start = context.len().saturating_sub(REPEAT_LAST_N);
                logits = apply_repeat_penalty(&logits, params.repetition_penalty, &context[start..])
                    .map_err(gen_err)?;
            }

            let next = processor.sample(&logits).map_err(gen_err)?;
            if loaded.eos.contains(&next) {
                break;
            }
            context.push(next);
            generated.push(next);
            input = vec![next];
        }

        let text = loaded.tokenizer.decode(&generated, true).map_err(gen_err)?;
        Ok(text.trim().to_string())
    }

    fn chat_generate(
        &mut self,
        messages: &[ChatMessage],
        params: &TuningProfile,
    ) -> Result<String, BackendError> {
        if self.loaded.is_none() {
            return Err(BackendError::NotLoaded);
        }
        self.generate(&flatten_chat(messages), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Role;

    #[test]
    fn test_generate_without_model_fails() {
        let mut backend = CandleBackend::new();
        let params = TuningProfile::default();
        assert!(matches!(backend.generate("hi", &params), Err(BackendError::NotLoaded)));
        assert!(matches!(
            backend.chat_generate(&[ChatMessage::new(Role::User, "hi")], &params),
            Err(BackendError::NotLoaded)
        ));
        backend.unload();
        assert!(!backend.is_loaded());
    }

    #[test]
    fn test_load_requires_tokenizer_and_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

        let mut backend = CandleBackend::new();
        let err = backend.load(dir.path(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert!(!backend.is_loaded());
    }

    #[test]
    fn test_greedy_when_sampling_off() {
        let params = TuningProfile {
            do_sample: false,
            ..Default::default()
        };
        assert!(matches!(sampling(&params), Sampling::ArgMax));
        assert!(matches!(
            sampling(&TuningProfile::default()),
            Sampling::TopKThenTopP { k: 50, .. }
        ));
    }
}
