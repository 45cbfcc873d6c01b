//! Quantized-file runner on llama.cpp
//!
//! Loads a single GGUF file (the largest one when given a directory) and
//! offloads layers to the accelerator when one is available.

use super::backend::{time_seed, Backend, BackendError, LoadOptions};
use crate::system::gpu;
use crate::types::config::TuningProfile;
use crate::types::message::{flatten_chat, ChatMessage};
use crate::types::model::{BackendKind, DeviceInfo};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use once_cell::sync::OnceCell;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

/// llama.cpp may only be initialised once per process
static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn llama_backend() -> Result<&'static LlamaBackend, BackendError> {
    LLAMA_BACKEND
        .get_or_try_init(LlamaBackend::init)
        .map_err(|e| BackendError::Load(format!("llama.cpp init failed: {}", e)))
}

/// Pick the model file: the path itself, or the largest `.gguf` below it
pub fn resolve_gguf(path: &Path) -> Result<PathBuf, BackendError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(BackendError::NotFound(path.display().to_string()));
    }

    let pattern = format!("{}/**/*.gguf", glob::Pattern::escape(&path.to_string_lossy()));
    glob::glob(&pattern)
        .map_err(|e| BackendError::Load(e.to_string()))?
        .filter_map(|p| p.ok())
        .filter_map(|p| std::fs::metadata(&p).ok().map(|m| (m.len(), p)))
        .max_by_key(|(len, _)| *len)
        .map(|(_, p)| p)
        .ok_or_else(|| BackendError::NotFound(format!("no .gguf file in {}", path.display())))
}

struct Loaded {
    model: LlamaModel,
    path: PathBuf,
    options: LoadOptions,
}

pub struct LlamaCppBackend {
    loaded: Option<Loaded>,
}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self { loaded: None }
    }

    fn run(&self, prompt: &str, params: &TuningProfile) -> Result<String, BackendError> {
        let loaded = self.loaded.as_ref().ok_or(BackendError::NotLoaded)?;
        let backend = llama_backend()?;
        let err = |e: &dyn std::fmt::Display| BackendError::Generation(e.to_string());

        let n_ctx = loaded.options.context_size.max(512);
        let ctx_params = LlamaContextParams::default().with_n_ctx(NonZeroU32::new(n_ctx));
        let mut ctx = loaded
            .model
            .new_context(backend, ctx_params)
            .map_err(|e| err(&e))?;

        let tokens = loaded
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| err(&e))?;
        if tokens.len() as u32 >= n_ctx {
            return Err(BackendError::Generation(format!(
                "prompt is {} tokens, context window is {}",
                tokens.len(),
                n_ctx
            )));
        }

        let mut batch = LlamaBatch::new(tokens.len().max(512), 1);
        let last = tokens.len() as i32 - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i as i32 == last)
                .map_err(|e| err(&e))?;
        }
        ctx.decode(&mut batch).map_err(|e| err(&e))?;

        let top_k = i32::try_from(params.top_k).map_err(|_| {
            BackendError::Generation(format!("top_k out of range: {}", params.top_k))
        })?;
        let mut sampler = if params.do_sample && params.temperature > 0.0 {
            LlamaSampler::chain_simple([
                LlamaSampler::penalties(64, params.repetition_penalty, 0.0, 0.0),
                LlamaSampler::top_k(top_k),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(time_seed() as u32),
            ])
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::penalties(64, params.repetition_penalty, 0.0, 0.0),
                LlamaSampler::greedy(),
            ])
        };

        let mut out: Vec<u8> = Vec::new();
        let mut pos = batch.n_tokens();
        for _ in 0..params.max_tokens {
            if pos as u32 >= n_ctx {
                tracing::warn!("Context window full, stopping generation");
                break;
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if loaded.model.is_eog_token(token) {
                break;
            }

            let piece = loaded
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| err(&e))?;
            out.extend_from_slice(&piece);

            batch.clear();
            batch.add(token, pos, &[0], true).map_err(|e| err(&e))?;
            ctx.decode(&mut batch).map_err(|e| err(&e))?;
            pos += 1;
        }

        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Render messages with the model's own chat template if it ships one
    fn chat_prompt(&self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        let loaded = self.loaded.as_ref().ok_or(BackendError::NotLoaded)?;

        let template = match loaded.model.chat_template(None) {
            Ok(template) => template,
            Err(e) => {
                tracing::debug!(error = %e, "No chat template in model, flattening");
                return Ok(flatten_chat(messages));
            }
        };

        let chat: Result<Vec<LlamaChatMessage>, _> = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect();
        let chat = match chat {
            Ok(chat) => chat,
            Err(_) => return Ok(flatten_chat(messages)),
        };

        match loaded.model.apply_chat_template(&template, &chat, true) {
            Ok(prompt) => Ok(prompt),
            Err(e) => {
                tracing::debug!(error = %e, "Chat template failed, flattening");
                Ok(flatten_chat(messages))
            }
        }
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LlamaCppBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LlamaCpp
    }

    fn load(&mut self, path: &Path, options: &LoadOptions) -> Result<(), BackendError> {
        self.unload();

        let file = resolve_gguf(path)?;
        let backend = llama_backend()?;
        tracing::info!(path = %file.display(), gpu_layers = options.gpu_layers, "Loading GGUF model");

        let params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
        let model = LlamaModel::load_from_file(backend, &file, &params)
            .map_err(|e| BackendError::Load(e.to_string()))?;

        self.loaded = Some(Loaded {
            model,
            path: file,
            options: *options,
        });
        Ok(())
    }

    fn unload(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            tracing::info!(path = %loaded.path.display(), "Unloading GGUF model");
            drop(loaded);
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn device_info(&self) -> DeviceInfo {
        match &self.loaded {
            Some(loaded) if loaded.options.gpu_layers > 0 => gpu::device_info(),
            _ => DeviceInfo::cpu(),
        }
    }

    fn generate(&mut self, prompt: &str, params: &TuningProfile) -> Result<String, BackendError> {
        self.run(prompt, params)
    }

    fn chat_generate(
        &mut self,
        messages: &[ChatMessage],
        params: &TuningProfile,
    ) -> Result<String, BackendError> {
        let prompt = self.chat_prompt(messages)?;
        self.run(&prompt, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Role;

    #[test]
    fn test_generate_without_model_fails() {
        let mut backend = LlamaCppBackend::new();
        let params = TuningProfile::default();
        assert!(matches!(backend.generate("hi", &params), Err(BackendError::NotLoaded)));
        assert!(matches!(
            backend.chat_generate(&[ChatMessage::new(Role::User, "hi")], &params),
            Err(BackendError::NotLoaded)
        ));

        backend.unload();
        backend.unload();
        assert!(!backend.is_loaded());
        assert_eq!(backend.device_info(), DeviceInfo::cpu());
    }

    #[test]
    fn test_resolve_picks_largest_gguf() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.Q2_K.gguf"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("big.Q8_0.gguf"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("README.md"), vec![0u8; 1000]).unwrap();

        let picked = resolve_gguf(dir.path()).unwrap();
        assert_eq!(picked.file_name().unwrap(), "big.Q8_0.gguf");
    }

    #[test]
    fn test_resolve_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(resolve_gguf(dir.path()), Err(BackendError::NotFound(_))));
        assert!(matches!(
            resolve_gguf(&dir.path().join("nope.gguf")),
            Err(BackendError::NotFound(_))
        ));
    }
}
