//! Lock-owning engine
//!
//! One `Engine` is shared by the command dispatcher and the HTTP gateway.
//! Every load, unload and generation takes the same model lock on a blocking
//! thread. The published status and the loading marker sit behind their own
//! light locks so status queries never wait for a load to finish.

use super::backend::{BackendFactory, LoadOptions};
use super::router::InferenceRouter;
use super::InferenceError;
use crate::storage::cache::ModelCache;
use crate::types::config::TuningProfile;
use crate::types::message::ChatMessage;
use crate::types::model::{BackendChoice, BackendKind, DeviceInfo, ModelStatus};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Clone)]
pub struct Engine {
    router: Arc<Mutex<InferenceRouter>>,
    status: Arc<RwLock<ModelStatus>>,
    loading: Arc<RwLock<Option<String>>>,
}

/// Clears the loading marker however the load ends, unless a later load
/// has already replaced it
struct LoadingGuard {
    slot: Arc<RwLock<Option<String>>>,
    id: Option<String>,
}

impl LoadingGuard {
    fn set(slot: &Arc<RwLock<Option<String>>>, id: Option<String>) -> Self {
        *slot.write() = id.clone();
        Self {
            slot: slot.clone(),
            id,
        }
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.write();
        if *slot == self.id {
            *slot = None;
        }
    }
}

impl Engine {
    pub fn new(factory: Arc<dyn BackendFactory>, cache: ModelCache, options: LoadOptions) -> Self {
        Self {
            router: Arc::new(Mutex::new(InferenceRouter::new(factory, cache, options))),
            status: Arc::new(RwLock::new(ModelStatus::empty())),
            loading: Arc::new(RwLock::new(None)),
        }
    }

    /// Last published model status
    pub fn status(&self) -> ModelStatus {
        self.status.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.status.read().loaded
    }

    /// Id of the model currently being loaded, if any
    pub fn loading_model(&self) -> Option<String> {
        self.loading.read().clone()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.status.read().device.clone()
    }

    /// Run `f` on the router under the model lock, then republish the status
    async fn with_router<T, F>(&self, f: F) -> Result<T, InferenceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut InferenceRouter) -> Result<T, InferenceError> + Send + 'static,
    {
        let router = self.router.clone();
        let status = self.status.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = router.lock();
            let result = f(&mut guard);
            *status.write() = guard.status();
            result
        })
        .await
        .map_err(|e| InferenceError::Task(e.to_string()))?
    }

    pub async fn load_model(
        &self,
        model_id: &str,
        choice: BackendChoice,
    ) -> Result<ModelStatus, InferenceError> {
        let id = model_id.to_string();
        let _guard = LoadingGuard::set(&self.loading, Some(id.clone()));

        let result = self.with_router(move |r| r.load_model(&id, choice)).await;
        if let Ok(status) = &result {
            tracing::info!(
                model_id,
                backend = ?status.backend,
                "Model loaded"
            );
        }
        result
    }

    pub async fn switch_backend(&self, kind: BackendKind) -> Result<ModelStatus, InferenceError> {
        let _guard = LoadingGuard::set(&self.loading, self.status().model_id);

        self.with_router(move |r| r.reload_with_backend(kind)).await
    }

    /// Returns whether a model was resident
    pub async fn unload(&self) -> Result<bool, InferenceError> {
        self.with_router(|r| Ok(r.unload_model())).await
    }

    pub async fn generate(
        &self,
        prompt: String,
        params: TuningProfile,
    ) -> Result<String, InferenceError> {
        self.with_router(move |r| r.generate(&prompt, &params)).await
    }

    pub async fn chat_generate(
        &self,
        messages: Vec<ChatMessage>,
        params: TuningProfile,
    ) -> Result<String, InferenceError> {
        self.with_router(move |r| r.chat_generate(&messages, &params)).await
    }

    /// Point path resolution at another cache root
    pub async fn set_cache(&self, cache: ModelCache) -> Result<(), InferenceError> {
        self.with_router(move |r| {
            r.set_cache(cache);
            Ok(())
        })
        .await
    }
}
