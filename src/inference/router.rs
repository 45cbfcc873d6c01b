//! Inference router
//!
//! Owns at most one loaded backend. Not thread-safe on its own: every call
//! goes through the engine's model lock.

use super::backend::{Backend, BackendError, BackendFactory, LoadOptions};
use super::InferenceError;
use crate::storage::cache::ModelCache;
use crate::types::config::TuningProfile;
use crate::types::message::ChatMessage;
use crate::types::model::{BackendChoice, BackendKind, DeviceInfo, ModelStatus};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

struct ActiveModel {
    /// Id as the caller gave it
    model_id: String,
    local_path: PathBuf,
    backend: Box<dyn Backend>,
}

pub struct InferenceRouter {
    factory: Arc<dyn BackendFactory>,
    cache: ModelCache,
    options: LoadOptions,
    active: Option<ActiveModel>,
}

/// Pick a backend from file names, falling back to a magic-byte check
pub fn detect_backend(path: &Path) -> BackendKind {
    if path.is_file() {
        let by_ext = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
        if by_ext || has_gguf_magic(path) {
            return BackendKind::LlamaCpp;
        }
        return BackendKind::Transformers;
    }

    let pattern = format!("{}/**/*.gguf", glob::Pattern::escape(&path.to_string_lossy()));
    let has_gguf = glob::glob(&pattern)
        .map(|mut paths| paths.any(|p| p.is_ok()))
        .unwrap_or(false);
    if has_gguf {
        BackendKind::LlamaCpp
    } else {
        BackendKind::Transformers
    }
}

fn has_gguf_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == GGUF_MAGIC)
        .unwrap_or(false)
}

impl InferenceRouter {
    pub fn new(factory: Arc<dyn BackendFactory>, cache: ModelCache, options: LoadOptions) -> Self {
        Self {
            factory,
            cache,
            options,
            active: None,
        }
    }

    pub fn set_cache(&mut self, cache: ModelCache) {
        self.cache = cache;
    }

    /// A path that exists is used as-is; anything else is looked up in the cache
    pub fn resolve_path(&self, model_id: &str) -> Result<PathBuf, InferenceError> {
        let direct = PathBuf::from(shellexpand_home(model_id));
        if direct.exists() {
            return Ok(direct);
        }
        self.cache
            .resolve(model_id)
            .ok_or_else(|| InferenceError::ModelNotFound(model_id.to_string()))
    }

    /// Unload whatever is resident, then load `model_id`.
    ///
    /// On failure nothing is left loaded.
    pub fn load_model(
        &mut self,
        model_id: &str,
        choice: BackendChoice,
    ) -> Result<ModelStatus, InferenceError> {
        self.unload_model();

        let local_path = self.resolve_path(model_id)?;
        let kind = match choice {
            BackendChoice::Forced(kind) => kind,
            BackendChoice::Auto => detect_backend(&local_path),
        };
        tracing::info!(
            model_id,
            backend = %kind,
            path = %local_path.display(),
            "Loading model"
        );

        let mut backend = self.factory.create(kind);
        if let Err(e) = backend.load(&local_path, &self.options) {
            tracing::error!(model_id, error = %e, "Model load failed");
            backend.unload();
            return Err(e.into());
        }

        self.active = Some(ActiveModel {
            model_id: model_id.to_string(),
            local_path,
            backend,
        });
        Ok(self.status())
    }

    /// Full unload and reload of the current model on another backend
    pub fn reload_with_backend(&mut self, kind: BackendKind) -> Result<ModelStatus, InferenceError> {
        let model_id = self
            .active
            .as_ref()
            .map(|a| a.model_id.clone())
            .ok_or(InferenceError::NotLoaded)?;
        self.load_model(&model_id, BackendChoice::Forced(kind))
    }

    /// Returns whether a model was resident
    pub fn unload_model(&mut self) -> bool {
        match self.active.take() {
            Some(mut active) => {
                tracing::info!(model_id = %active.model_id, "Unloading model");
                active.backend.unload();
                true
            }
            None => false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.backend.is_loaded())
    }

    pub fn status(&self) -> ModelStatus {
        match &self.active {
            Some(active) => ModelStatus {
                loaded: active.backend.is_loaded(),
                model_id: Some(active.model_id.clone()),
                backend: Some(active.backend.kind()),
                local_path: Some(active.local_path.display().to_string()),
                device: Some(active.backend.device_info()),
            },
            None => ModelStatus::empty(),
        }
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.active.as_ref().map(|a| a.backend.device_info())
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn Backend>, InferenceError> {
        match self.active.as_mut() {
            Some(active) if active.backend.is_loaded() => Ok(&mut active.backend),
            _ => Err(InferenceError::NotLoaded),
        }
    }

    pub fn generate(&mut self, prompt: &str, params: &TuningProfile) -> Result<String, InferenceError> {
        Ok(self.backend_mut()?.generate(prompt, params)?)
    }

    pub fn chat_generate(
        &mut self,
        messages: &[ChatMessage],
        params: &TuningProfile,
    ) -> Result<String, InferenceError> {
        Ok(self.backend_mut()?.chat_generate(messages, params)?)
    }
}

/// Expand a leading `~/`
fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(rest).display().to_string();
        }
    }
    path.to_string()
}

impl From<BackendError> for InferenceError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotLoaded => InferenceError::NotLoaded,
            other => InferenceError::Backend(other),
        }
    }
}
