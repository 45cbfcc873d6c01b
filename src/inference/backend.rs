//! Backend contract
//!
//! A backend owns one resident model and turns prompts into text. All calls
//! are blocking and must run under the engine's model lock.

use crate::types::config::TuningProfile;
use crate::types::message::ChatMessage;
use crate::types::model::{BackendKind, DeviceInfo};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Unsupported model: {0}")]
    Unsupported(String),
}

/// Load-time knobs shared by all backends
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    /// Layers offloaded to the accelerator (quantized runner only)
    pub gpu_layers: u32,
    /// Context window in tokens
    pub context_size: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gpu_layers: 99,
            context_size: 4096,
        }
    }
}

pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Load weights from a file or directory, replacing anything resident
    fn load(&mut self, path: &Path, options: &LoadOptions) -> Result<(), BackendError>;

    /// Release the model and its accelerator memory. Idempotent.
    fn unload(&mut self);

    fn is_loaded(&self) -> bool;

    fn device_info(&self) -> DeviceInfo;

    fn generate(&mut self, prompt: &str, params: &TuningProfile) -> Result<String, BackendError>;

    fn chat_generate(
        &mut self,
        messages: &[ChatMessage],
        params: &TuningProfile,
    ) -> Result<String, BackendError>;
}

/// Builds empty backends of a given kind
pub trait BackendFactory: Send + Sync {
    fn create(&self, kind: BackendKind) -> Box<dyn Backend>;
}

/// The real runners
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackends;

impl BackendFactory for NativeBackends {
    fn create(&self, kind: BackendKind) -> Box<dyn Backend> {
        match kind {
            BackendKind::LlamaCpp => Box::new(super::llama::LlamaCppBackend::new()),
            BackendKind::Transformers => Box::new(super::candle::CandleBackend::new()),
        }
    }
}

/// Seed for sampling when the caller gives none
pub(crate) fn time_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(42)
}
