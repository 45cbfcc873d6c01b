//! Command dispatch
//!
//! [`DaemonContext`] is the single owner of daemon state. Every command is
//! matched to a handler here; handler errors and panics become `ok:false`
//! responses at the dispatch boundary.

use super::logging::LogHandle;
use super::paths::DaemonPaths;
use super::protocol::{Command, Response};
use super::{DaemonError, DaemonPhase};
use crate::download::manager::DownloadRequest;
use crate::download::{DownloadError, DownloadManager};
use crate::gateway::{GatewayHandle, GatewayState};
use crate::inference::{BackendFactory, Engine, InferenceError, LoadOptions};
use crate::storage::cache::ModelCache;
use crate::storage::format_size;
use crate::storage::huggingface::{Hub, HubError, HuggingFaceUrl};
use crate::storage::keys::{KeyStatus, KeyStore, KeyStoreError, SqliteKeyStore, StatusFilter};
use crate::storage::settings::ConfigStore;
use crate::storage::StorageError;
use crate::system::gpu;
use crate::types::config::{ServerConfig, TuningProfile, TuningUpdate, LOG_LEVELS};
use crate::types::message::ChatMessage;
use crate::types::model::{BackendChoice, BackendKind};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};

/// Delay between acknowledging `shutdown` and starting to stop
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(300);

const DEFAULT_SEARCH_LIMIT: usize = 20;
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Keys(#[from] KeyStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn invalid(msg: impl Into<String>) -> CommandError {
    CommandError::Invalid(msg.into())
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Internal(e.to_string()))
}

pub struct DaemonContext {
    paths: DaemonPaths,
    config: Arc<ConfigStore>,
    keys: Arc<SqliteKeyStore>,
    engine: Engine,
    downloads: DownloadManager,
    cache: RwLock<ModelCache>,
    gateway: AsyncMutex<Option<GatewayHandle>>,
    phase: RwLock<DaemonPhase>,
    started: Instant,
    shutdown: Arc<watch::Sender<bool>>,
    log: Option<LogHandle>,
}

impl DaemonContext {
    /// Open config and key store under `paths` and build the services.
    ///
    /// Must be called inside a tokio runtime; download workers drive it.
    pub fn new(
        paths: DaemonPaths,
        factory: Arc<dyn BackendFactory>,
        hub: Arc<dyn Hub>,
        log: Option<LogHandle>,
    ) -> Result<Self, DaemonError> {
        paths.ensure()?;
        let config = Arc::new(ConfigStore::open(paths.config_file()));
        let keys = Arc::new(SqliteKeyStore::open(&paths.keys_db())?);

        let settings = config.get();
        hub.set_token(settings.hf_token.clone());
        let cache = ModelCache::new(ModelCache::default_root(settings.model_dir.as_deref()));
        let engine = Engine::new(factory, cache.clone(), LoadOptions::default());
        let downloads = DownloadManager::new(hub, tokio::runtime::Handle::current());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            paths,
            config,
            keys,
            engine,
            downloads,
            cache: RwLock::new(cache),
            gateway: AsyncMutex::new(None),
            phase: RwLock::new(DaemonPhase::NotRunning),
            started: Instant::now(),
            shutdown: Arc::new(shutdown),
            log,
        })
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    pub fn config(&self) -> ServerConfig {
        self.config.get()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn phase(&self) -> DaemonPhase {
        *self.phase.read()
    }

    pub fn set_phase(&self, phase: DaemonPhase) {
        let mut current = self.phase.write();
        if *current != phase {
            tracing::debug!(from = %*current, to = %phase, "Daemon phase");
            *current = phase;
        }
    }

    fn cache(&self) -> ModelCache {
        self.cache.read().clone()
    }

    /// Ask the accept loop to stop
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Parse and run one request line
    pub async fn handle_line(self: &Arc<Self>, line: &str) -> Response {
        match Command::parse(line) {
            Ok(cmd) => self.dispatch(cmd).await,
            Err(msg) => {
                tracing::debug!(error = %msg, "Rejected request");
                Response::error(msg)
            }
        }
    }

    /// Run a command on its own task so a panicking handler only fails its own request
    pub async fn dispatch(self: &Arc<Self>, cmd: Command) -> Response {
        let name = cmd.name();
        let ctx = self.clone();
        match tokio::spawn(async move { ctx.handle(cmd).await }).await {
            Ok(Ok(data)) => Response::ok(data),
            Ok(Err(e)) => {
                tracing::warn!(command = name, error = %e, "Command failed");
                Response::error(e.to_string())
            }
            Err(e) => {
                tracing::error!(command = name, error = %e, "Command handler crashed");
                Response::error("Internal daemon error")
            }
        }
    }

    async fn handle(&self, cmd: Command) -> Result<Value, CommandError> {
        match cmd {
            Command::Ping => Ok(json!("pong")),
            Command::GetStatus => self.get_status().await,

            Command::StartServer => self.start_server().await,
            Command::StopServer => self.stop_server().await,
            Command::SetServerPort { port, host } => self.set_server_port(port, host).await,

            Command::LoadModel { model_id, backend } => self.load_model(&model_id, backend).await,
            Command::SwitchBackend { backend } => self.switch_backend(&backend).await,
            Command::UnloadModel => self.unload_model().await,
            Command::ModelStatus => Ok(self.model_status()),
            Command::DeviceInfo => self.device_info().await,

            Command::ListModels => self.list_models().await,
            Command::SearchModels { query, limit } => self.search_models(&query, limit).await,
            Command::DeleteModel { model_id } => self.delete_model(&model_id).await,
            Command::CacheSize => self.cache_size().await,
            Command::ListRepoFiles { model_id } => self.list_repo_files(&model_id).await,
            Command::DownloadModel {
                model_id,
                filenames,
            } => self.download_model(&model_id, filenames),
            Command::DownloadStatus => to_value(self.downloads.snapshot()),
            Command::CancelDownload => Ok(json!({ "cancelled": self.downloads.cancel() })),

            Command::ListKeys { status_filter } => {
                let filter = StatusFilter::parse(status_filter.as_deref())?;
                to_value(self.with_keys(move |k| k.list_keys(filter)).await?)
            }
            Command::AddKey {
                name,
                expires_in_days,
            } => self.add_key(name, expires_in_days).await,
            Command::SetKeyStatus { key_id, status } => {
                let status: KeyStatus = status.parse()?;
                self.set_key_status(key_id, status).await
            }
            Command::RevokeKey { key_id } => self.set_key_status(key_id, KeyStatus::Revoked).await,
            Command::ActivateKey { key_id } => self.set_key_status(key_id, KeyStatus::Active).await,
            Command::DeleteKey { key_id } => self.set_key_status(key_id, KeyStatus::Deleted).await,
            Command::KeyCount => to_value(self.with_keys(|k| k.key_count()).await?),
            Command::KeyUsage { key_id } => {
                to_value(self.with_keys(move |k| k.usage_summary(key_id)).await?)
            }
            Command::KeyUsageHistory { key_id, limit } => {
                let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
                to_value(self.with_keys(move |k| k.usage_history(key_id, limit)).await?)
            }

            Command::GetConfig => Ok(config_view(&self.config.get(), &self.cache())),
            Command::SetTuning(update) => self.set_tuning(update),
            Command::ResetTuning => {
                let config = self.config.update(|c| c.tuning = TuningProfile::default())?;
                tracing::info!("Tuning reset to defaults");
                Ok(config_view(&config, &self.cache()))
            }
            Command::SetHfToken { token } => self.set_hf_token(&token).await,
            Command::HfStatus => self.hf_status().await,
            Command::SetAutoRestore { enabled } => {
                let config = match enabled {
                    Some(enabled) => self.config.update(|c| c.auto_restore = enabled)?,
                    None => self.config.get(),
                };
                Ok(json!({ "auto_restore": config.auto_restore }))
            }
            Command::SetModelDir { path } => self.set_model_dir(&path).await,
            Command::SetLogLevel { level } => self.set_log_level(&level),

            Command::Generate { prompt } => self.generate(prompt).await,
            Command::ChatGenerate { messages } => self.chat_generate(messages).await,

            Command::Shutdown => {
                tracing::info!("Shutdown requested");
                let signal = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SHUTDOWN_DELAY).await;
                    signal.send_replace(true);
                });
                Ok(Value::Null)
            }
        }
    }

    // Status

    async fn get_status(&self) -> Result<Value, CommandError> {
        let config = self.config.get();
        let server_running = self
            .gateway
            .lock()
            .await
            .as_ref()
            .is_some_and(|g| g.is_running());
        let status = self.engine.status();

        Ok(json!({
            "daemon_phase": self.phase(),
            "pid": std::process::id(),
            "uptime_secs": self.started.elapsed().as_secs(),
            "server_running": server_running,
            "server_host": config.host,
            "server_port": config.port,
            "model_loaded": status.loaded,
            "model_id": status.model_id,
            "active_backend": status.backend,
            "loading_model": self.engine.loading_model(),
            "download_active": self.downloads.is_active(),
        }))
    }

    fn model_status(&self) -> Value {
        let status = self.engine.status();
        json!({
            "is_loaded": status.loaded,
            "model_id": status.model_id,
            "loading_model": self.engine.loading_model(),
        })
    }

    async fn device_info(&self) -> Result<Value, CommandError> {
        let status = self.engine.status();
        let (device, backend) = match (status.device, status.backend) {
            (Some(device), Some(backend)) if status.loaded => (device, backend.as_str()),
            _ => {
                let device = tokio::task::spawn_blocking(gpu::device_info)
                    .await
                    .map_err(|e| CommandError::Internal(e.to_string()))?;
                (device, "none")
            }
        };

        let mut value = to_value(device)?;
        value["backend"] = json!(backend);
        Ok(value)
    }

    // Gateway

    fn gateway_state(&self) -> GatewayState {
        let keys: Arc<dyn KeyStore> = self.keys.clone();
        GatewayState {
            engine: self.engine.clone(),
            keys,
            config: self.config.clone(),
        }
    }

    async fn launch_gateway(&self, slot: &mut Option<GatewayHandle>) -> Result<u16, CommandError> {
        let config = self.config.get();
        let handle = GatewayHandle::start(self.gateway_state(), &config.host, config.port)
            .await
            .map_err(|e| invalid(format!("Cannot bind {}:{}: {}", config.host, config.port, e)))?;
        let port = handle.addr().port();
        *slot = Some(handle);
        Ok(port)
    }

    async fn start_server(&self) -> Result<Value, CommandError> {
        let mut slot = self.gateway.lock().await;
        if slot.as_ref().is_some_and(|g| g.is_running()) {
            return Err(invalid("Server is already running"));
        }

        let port = self.launch_gateway(&mut slot).await?;
        let config = self.config.update(|c| c.server_was_running = true)?;
        tracing::info!(host = %config.host, port, "API server started");
        Ok(json!({ "host": config.host, "port": port }))
    }

    async fn stop_server(&self) -> Result<Value, CommandError> {
        let handle = self.gateway.lock().await.take();
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.config.update(|c| c.server_was_running = false)?;
        Ok(json!({ "was_running": was_running }))
    }

    async fn set_server_port(
        &self,
        port: Option<u16>,
        host: Option<String>,
    ) -> Result<Value, CommandError> {
        if let Some(port) = port {
            if port < 1024 {
                return Err(invalid("Port must be 1024-65535"));
            }
        }
        if host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(invalid("Host must not be empty"));
        }

        let config = self.config.update(|c| {
            if let Some(port) = port {
                c.port = port;
            }
            if let Some(host) = host {
                c.host = host.trim().to_string();
            }
        })?;

        let mut slot = self.gateway.lock().await;
        let restart = slot.as_ref().is_some_and(|g| g.is_running());
        if restart {
            if let Some(old) = slot.take() {
                old.stop().await;
            }
            self.launch_gateway(&mut slot).await?;
            tracing::info!(host = %config.host, port = config.port, "API server restarted");
        }

        Ok(json!({ "host": config.host, "port": config.port, "restarted": restart }))
    }

    // Model slot

    async fn load_model(&self, model_id: &str, backend: Option<String>) -> Result<Value, CommandError> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(invalid("No model_id provided"));
        }
        let choice = BackendChoice::parse(backend.as_deref()).map_err(invalid)?;

        match self.engine.load_model(model_id, choice).await {
            Ok(status) => {
                self.config.update(|c| c.active_model = model_id.to_string())?;
                Ok(json!({
                    "model_id": status.model_id,
                    "backend": status.backend,
                    "device": status.device,
                }))
            }
            Err(e) => {
                tracing::error!(model_id, error = %e, "Failed to load model");
                self.config.update(|c| c.active_model.clear())?;
                Err(e.into())
            }
        }
    }

    async fn switch_backend(&self, backend: &str) -> Result<Value, CommandError> {
        let kind: BackendKind = backend.parse().map_err(invalid)?;
        let status = match self.engine.switch_backend(kind).await {
            Ok(status) => status,
            Err(e) => {
                // The old backend was already dropped, so nothing is left to restore
                tracing::warn!(backend = %kind, error = %e, "Backend switch failed, model unloaded");
                if let Err(save) = self.config.update(|c| c.active_model.clear()) {
                    tracing::warn!(error = %save, "Could not clear active model");
                }
                return Err(e.into());
            }
        };
        tracing::info!(backend = %kind, model_id = ?status.model_id, "Backend switched");
        Ok(json!({ "backend": status.backend, "model_id": status.model_id }))
    }

    async fn unload_model(&self) -> Result<Value, CommandError> {
        let was_loaded = self.engine.unload().await?;
        self.config.update(|c| c.active_model.clear())?;
        tracing::info!(was_loaded, "Model unloaded");
        Ok(json!({ "was_loaded": was_loaded }))
    }

    async fn generate(&self, prompt: String) -> Result<Value, CommandError> {
        let params = self.config.get().tuning;
        let text = self.engine.generate(prompt, params).await?;
        Ok(json!({ "text": text }))
    }

    async fn chat_generate(&self, messages: Vec<ChatMessage>) -> Result<Value, CommandError> {
        let params = self.config.get().tuning;
        let text = self.engine.chat_generate(messages, params).await?;
        Ok(json!({ "text": text }))
    }

    // Cache and hub

    async fn list_models(&self) -> Result<Value, CommandError> {
        let cache = self.cache();
        let models = tokio::task::spawn_blocking(move || cache.list_models())
            .await
            .map_err(|e| CommandError::Internal(e.to_string()))?;
        let status = self.engine.status();

        let mut out = Vec::with_capacity(models.len());
        for model in models {
            let is_loaded = status.loaded && status.model_id.as_deref() == Some(model.repo_id.as_str());
            let mut value = to_value(model)?;
            value["is_loaded"] = json!(is_loaded);
            value["backend"] = if is_loaded { json!(status.backend) } else { Value::Null };
            out.push(value);
        }
        Ok(Value::Array(out))
    }

    async fn search_models(&self, query: &str, limit: Option<usize>) -> Result<Value, CommandError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(invalid("No query provided"));
        }
        let mut hits = self
            .downloads
            .hub()
            .search(query, limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
            .await?;
        hits.sort_by(|a, b| b.downloads.cmp(&a.downloads));
        to_value(hits)
    }

    async fn delete_model(&self, model_id: &str) -> Result<Value, CommandError> {
        if model_id.trim().is_empty() {
            return Err(invalid("No model_id provided"));
        }
        let repo_id = HuggingFaceUrl::parse(model_id).map_err(invalid)?.repo_id;
        let model_id = repo_id.as_str();
        if self.downloads.active_model().as_deref() == Some(model_id) {
            return Err(invalid(format!("{} is still downloading", model_id)));
        }

        if self.engine.status().model_id.as_deref() == Some(model_id) {
            self.engine.unload().await?;
            self.config.update(|c| c.active_model.clear())?;
        }

        let cache = self.cache();
        let id = model_id.to_string();
        let deleted = tokio::task::spawn_blocking(move || cache.delete(&id))
            .await
            .map_err(|e| CommandError::Internal(e.to_string()))?
            .map_err(|e| invalid(format!("Could not delete {}: {}", model_id, e)))?;
        if !deleted {
            return Err(invalid(format!("Could not delete {}: not in cache", model_id)));
        }
        tracing::info!(model_id, "Deleted model");
        Ok(json!({ "deleted": model_id }))
    }

    async fn cache_size(&self) -> Result<Value, CommandError> {
        let cache = self.cache();
        let bytes = tokio::task::spawn_blocking(move || cache.total_size())
            .await
            .map_err(|e| CommandError::Internal(e.to_string()))?;
        Ok(json!({ "bytes": bytes, "size_str": format_size(bytes) }))
    }

    async fn list_repo_files(&self, model_id: &str) -> Result<Value, CommandError> {
        if model_id.trim().is_empty() {
            return Err(invalid("No model_id provided"));
        }
        let parsed = HuggingFaceUrl::parse(model_id).map_err(invalid)?;
        let manifest = self.downloads.hub().manifest(&parsed.repo_id).await?;
        let files: Vec<Value> = manifest
            .files
            .iter()
            .map(|f| json!({ "name": f.name, "size": f.size, "size_str": format_size(f.size) }))
            .collect();
        Ok(Value::Array(files))
    }

    fn download_model(
        &self,
        model_id: &str,
        filenames: Option<Vec<String>>,
    ) -> Result<Value, CommandError> {
        if model_id.trim().is_empty() {
            return Err(invalid("No model_id provided"));
        }
        let request = DownloadRequest::parse(model_id, filenames)?;
        let repo_id = request.repo_id.clone();
        let session = self.downloads.start(request, self.cache())?;
        tracing::info!(model_id = %repo_id, session, "Download started");
        Ok(json!({ "session": session, "model_id": repo_id }))
    }

    // Keys

    async fn with_keys<T, F>(&self, f: F) -> Result<T, CommandError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteKeyStore) -> Result<T, KeyStoreError> + Send + 'static,
    {
        let keys = self.keys.clone();
        tokio::task::spawn_blocking(move || f(keys.as_ref()))
            .await
            .map_err(|e| CommandError::Internal(e.to_string()))?
            .map_err(CommandError::from)
    }

    async fn add_key(&self, name: String, expires_in_days: Option<u32>) -> Result<Value, CommandError> {
        let name = if name.trim().is_empty() {
            "unnamed".to_string()
        } else {
            name.trim().to_string()
        };
        let key = self
            .with_keys(move |k| k.add_key(&name, expires_in_days))
            .await?;
        tracing::info!(key_id = key.id, name = %key.name, "API key created");
        Ok(json!({
            "id": key.id,
            "key": key.key,
            "name": key.name,
            "expires_at": key.expires_at,
        }))
    }

    async fn set_key_status(&self, key_id: i64, status: KeyStatus) -> Result<Value, CommandError> {
        let key = self.with_keys(move |k| k.set_status(key_id, status)).await?;
        tracing::info!(key_id, status = %status, "API key status changed");
        to_value(key)
    }

    // Configuration

    fn set_tuning(&self, update: TuningUpdate) -> Result<Value, CommandError> {
        update.check().map_err(invalid)?;
        let config = self.config.update(|c| c.tuning = update.apply_to(&c.tuning))?;
        tracing::info!(tuning = ?config.tuning, "Tuning updated");
        Ok(config_view(&config, &self.cache()))
    }

    async fn set_hf_token(&self, token: &str) -> Result<Value, CommandError> {
        let hub = self.downloads.hub();
        let token = token.trim();
        if token.is_empty() {
            self.config.update(|c| c.hf_token = None)?;
            hub.set_token(None);
            tracing::info!("Hub token cleared");
            return Ok(json!({ "logged_in": false }));
        }

        let username = match hub.whoami(token).await {
            Ok(username) => username,
            Err(e) => {
                tracing::warn!(error = %e, "Hub login failed");
                return Err(invalid(format!("Login failed: {}", e)));
            }
        };

        let stored = token.to_string();
        self.config.update(|c| c.hf_token = Some(stored))?;
        hub.set_token(Some(token.to_string()));
        tracing::info!(username = %username, "Hub login successful");
        Ok(json!({ "logged_in": true, "username": username }))
    }

    async fn hf_status(&self) -> Result<Value, CommandError> {
        let Some(token) = self.config.get().hf_token else {
            return Ok(json!({ "logged_in": false }));
        };
        match self.downloads.hub().whoami(&token).await {
            Ok(username) => Ok(json!({ "logged_in": true, "username": username })),
            Err(e) => {
                tracing::warn!(error = %e, "Hub token check failed");
                Ok(json!({ "logged_in": false, "error": "Token invalid" }))
            }
        }
    }

    async fn set_model_dir(&self, path: &str) -> Result<Value, CommandError> {
        let path = path.trim();
        let model_dir = if path.is_empty() {
            None
        } else {
            Some(prepare_model_dir(Path::new(path))?)
        };

        let config = self.config.update(|c| c.model_dir = model_dir.clone())?;
        let cache = ModelCache::new(ModelCache::default_root(config.model_dir.as_deref()));
        *self.cache.write() = cache.clone();
        self.engine.set_cache(cache.clone()).await?;

        tracing::info!(path = %cache.root().display(), "Model directory changed");
        Ok(json!({
            "model_dir": config.model_dir,
            "effective": cache.root(),
        }))
    }

    fn set_log_level(&self, level: &str) -> Result<Value, CommandError> {
        let level = level.trim().to_uppercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(format!("Invalid log level: {}", level)));
        }
        self.config.update(|c| c.log_level = level.clone())?;
        if let Some(log) = &self.log {
            if let Err(e) = log.set_level(&level) {
                tracing::warn!(error = %e, "Could not apply log level");
            }
        }
        tracing::info!(level = %level, "Log level changed");
        Ok(json!({ "log_level": level }))
    }

    // Lifecycle

    /// Reload the previous model and gateway. Failures are logged and cleared.
    pub async fn auto_restore(&self) {
        let config = self.config.get();
        if !config.auto_restore {
            return;
        }

        if !config.active_model.is_empty() {
            let model_id = config.active_model.clone();
            tracing::info!(model_id = %model_id, "Restoring model");
            match self.engine.load_model(&model_id, BackendChoice::Auto).await {
                Ok(_) => tracing::info!(model_id = %model_id, "Model restored"),
                Err(e) => {
                    tracing::error!(model_id = %model_id, error = %e, "Could not restore model");
                    if let Err(e) = self.config.update(|c| c.active_model.clear()) {
                        tracing::warn!(error = %e, "Could not save config");
                    }
                }
            }
        }

        if config.server_was_running {
            let mut slot = self.gateway.lock().await;
            if slot.is_none() {
                match self.launch_gateway(&mut slot).await {
                    Ok(port) => tracing::info!(port, "API server restored"),
                    Err(e) => tracing::error!(error = %e, "Could not restore API server"),
                }
            }
        }
    }

    /// Persist gateway state, then stop the gateway, downloads and model
    pub async fn stop_services(&self) {
        self.set_phase(DaemonPhase::Stopping);

        let gateway = self.gateway.lock().await.take();
        let was_running = gateway.as_ref().is_some_and(|g| g.is_running());
        if let Err(e) = self.config.update(|c| c.server_was_running = was_running) {
            tracing::warn!(error = %e, "Could not save config");
        }
        if let Some(gateway) = gateway {
            gateway.stop().await;
        }

        self.downloads.shutdown(Duration::from_secs(5)).await;

        match self.engine.unload().await {
            Ok(true) => tracing::info!("Model unloaded"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Unload during shutdown failed"),
        }
    }
}

/// Create `path` if missing and check it is a directory
fn prepare_model_dir(path: &Path) -> Result<PathBuf, CommandError> {
    let path = match path.strip_prefix("~") {
        Ok(rest) => directories::BaseDirs::new()
            .map(|d| d.home_dir().join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    };
    if !path.exists() {
        std::fs::create_dir_all(&path)
            .map_err(|e| invalid(format!("Cannot create directory: {}", e)))?;
    }
    if !path.is_dir() {
        return Err(invalid("Path is not a directory"));
    }
    Ok(std::fs::canonicalize(&path).unwrap_or(path))
}

/// Flat view returned by `get_config`; the hub token is reported, not echoed
fn config_view(config: &ServerConfig, cache: &ModelCache) -> Value {
    let t = &config.tuning;
    json!({
        "host": config.host,
        "port": config.port,
        "active_model": config.active_model,
        "auto_restore": config.auto_restore,
        "hf_token_set": config.hf_token.is_some(),
        "model_dir": config.model_dir,
        "effective_model_dir": cache.root(),
        "log_level": config.log_level,
        "temperature": t.temperature,
        "top_p": t.top_p,
        "top_k": t.top_k,
        "max_tokens": t.max_tokens,
        "repetition_penalty": t.repetition_penalty,
        "do_sample": t.do_sample,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::MockBackends;
    use crate::storage::huggingface::fake::FakeHub;

    struct Fixture {
        dir: tempfile::TempDir,
        ctx: Arc<DaemonContext>,
        hub: Arc<FakeHub>,
        backends: MockBackends,
    }

    fn fixture_with(backends: MockBackends) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::new(dir.path().join("home"));
        paths.ensure().unwrap();

        let cache_root = dir.path().join("models");
        let config = ServerConfig {
            model_dir: Some(cache_root.clone()),
            port: 0,
            ..Default::default()
        };
        crate::storage::settings::save_settings(&paths.config_file(), &config).unwrap();

        let snap = ModelCache::new(&cache_root).snapshot_dir("test/tiny-model", "rev1");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("model.safetensors"), b"weights").unwrap();
        std::fs::write(snap.join("config.json"), b"{}").unwrap();

        let hub = Arc::new(FakeHub::new(4, Duration::from_millis(1)));
        let ctx = DaemonContext::new(paths, Arc::new(backends.clone()), hub.clone(), None).unwrap();
        Fixture {
            dir,
            ctx: Arc::new(ctx),
            hub,
            backends,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockBackends::default())
    }

    async fn send(ctx: &Arc<DaemonContext>, value: Value) -> Response {
        ctx.handle_line(&value.to_string()).await
    }

    #[tokio::test]
    async fn test_ping_and_unknown_command() {
        let fx = fixture();
        let resp = send(&fx.ctx, json!({"cmd": "ping"})).await;
        assert!(resp.ok);
        assert_eq!(resp.data, Some(json!("pong")));

        let resp = send(&fx.ctx, json!({"cmd": "fly"})).await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().to_lowercase().contains("unknown command"));

        let resp = fx.ctx.handle_line("{not json").await;
        assert!(!resp.ok);
    }

    #[tokio::test]
    async fn test_load_generate_unload() {
        let fx = fixture();

        let resp = send(&fx.ctx, json!({"cmd": "load_model", "model_id": "test/tiny-model"})).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.data.unwrap()["backend"], "transformers");
        assert_eq!(fx.ctx.config().active_model, "test/tiny-model");

        let resp = send(&fx.ctx, json!({"cmd": "generate", "prompt": "hi"})).await;
        assert!(resp.ok);
        let text = resp.data.unwrap()["text"].as_str().unwrap().to_string();
        assert!(!text.is_empty());

        let resp = send(&fx.ctx, json!({"cmd": "unload_model"})).await;
        assert!(resp.ok);
        assert_eq!(fx.ctx.config().active_model, "");

        let resp = send(&fx.ctx, json!({"cmd": "generate", "prompt": "hi"})).await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().to_lowercase().contains("not loaded"));
    }

    #[tokio::test]
    async fn test_load_errors() {
        let fx = fixture();

        let resp = send(&fx.ctx, json!({"cmd": "load_model"})).await;
        assert_eq!(resp.error.as_deref(), Some("No model_id provided"));

        let resp = send(
            &fx.ctx,
            json!({"cmd": "load_model", "model_id": "test/tiny-model", "backend": "onnx"}),
        )
        .await;
        assert!(resp.error.unwrap().contains("Invalid backend"));

        let resp = send(&fx.ctx, json!({"cmd": "load_model", "model_id": "nobody/nothing"})).await;
        assert!(!resp.ok);
        assert!(!fx.ctx.engine().is_loaded());

        let resp = send(&fx.ctx, json!({"cmd": "switch_backend", "backend": "llama.cpp"})).await;
        assert!(resp.error.unwrap().to_lowercase().contains("not loaded"));
    }

    #[tokio::test]
    async fn test_switch_backend_and_status() {
        let fx = fixture();
        send(&fx.ctx, json!({"cmd": "load_model", "model_id": "test/tiny-model"})).await;

        let resp = send(&fx.ctx, json!({"cmd": "switch_backend", "backend": "llama.cpp"})).await;
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["backend"], "llama.cpp");

        let status = send(&fx.ctx, json!({"cmd": "get_status"})).await.data.unwrap();
        assert_eq!(status["model_loaded"], true);
        assert_eq!(status["active_backend"], "llama.cpp");
        assert_eq!(status["loading_model"], Value::Null);
        assert_eq!(status["server_running"], false);

        let model = send(&fx.ctx, json!({"cmd": "model_status"})).await.data.unwrap();
        assert_eq!(model["is_loaded"], true);
        assert_eq!(model["model_id"], "test/tiny-model");

        let device = send(&fx.ctx, json!({"cmd": "device_info"})).await.data.unwrap();
        assert_eq!(device["backend"], "llama.cpp");
        assert_eq!(device["type"], "CPU");
    }

    #[tokio::test]
    async fn test_failed_switch_forgets_active_model() {
        let fx = fixture_with(MockBackends {
            fail_kind: Some(BackendKind::LlamaCpp),
            ..Default::default()
        });
        let resp = send(&fx.ctx, json!({"cmd": "load_model", "model_id": "test/tiny-model"})).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(fx.ctx.config().active_model, "test/tiny-model");

        let resp = send(&fx.ctx, json!({"cmd": "switch_backend", "backend": "llama.cpp"})).await;
        assert!(!resp.ok);
        assert!(!fx.ctx.engine().is_loaded());
        assert_eq!(fx.ctx.config().active_model, "");

        // Nothing for the next start to restore either
        let saved = crate::storage::settings::load_settings(&fx.ctx.paths().config_file());
        assert_eq!(saved.active_model, "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_refused_for_downloading_url() {
        let fx = fixture();
        fx.hub.add_repo("acme/slow", "s1", &[("weights.gguf", 4096)]);

        let resp = send(&fx.ctx, json!({"cmd": "download_model", "model_id": "acme/slow"})).await;
        assert!(resp.ok, "{:?}", resp.error);

        for form in ["https://huggingface.co/acme/slow", "acme/slow/weights.gguf"] {
            let resp = send(&fx.ctx, json!({"cmd": "delete_model", "model_id": form})).await;
            assert!(
                resp.error.unwrap().contains("still downloading"),
                "{} was not refused",
                form
            );
        }

        send(&fx.ctx, json!({"cmd": "cancel_download"})).await;
    }

    #[tokio::test]
    async fn test_tuning_round_trip() {
        let fx = fixture();

        let resp = send(&fx.ctx, json!({"cmd": "set_tuning", "temperature": 0.25, "top_k": 9})).await;
        assert!(resp.ok);
        let resp = send(&fx.ctx, json!({"cmd": "set_tuning", "max_tokens": 64})).await;
        assert!(resp.ok);

        let config = send(&fx.ctx, json!({"cmd": "get_config"})).await.data.unwrap();
        assert_eq!(config["temperature"], 0.25);
        assert_eq!(config["top_k"], 9);
        assert_eq!(config["max_tokens"], 64);
        assert_eq!(config["top_p"], json!(TuningProfile::default().top_p));

        let resp = send(&fx.ctx, json!({"cmd": "set_tuning", "top_p": 1.5})).await;
        assert!(!resp.ok);
        let config = send(&fx.ctx, json!({"cmd": "get_config"})).await.data.unwrap();
        assert_eq!(config["top_p"], json!(TuningProfile::default().top_p));

        let config = send(&fx.ctx, json!({"cmd": "reset_tuning"})).await.data.unwrap();
        assert_eq!(config["top_k"], 50);

        // Survives a reopen of the config file
        let reopened = ConfigStore::open(fx.ctx.paths().config_file());
        assert_eq!(reopened.get().tuning, TuningProfile::default());
    }

    #[tokio::test]
    async fn test_key_lifecycle() {
        let fx = fixture();

        let created = send(&fx.ctx, json!({"cmd": "add_key", "name": "ci"})).await.data.unwrap();
        let key_id = created["id"].as_i64().unwrap();
        let secret = created["key"].as_str().unwrap().to_string();
        assert!(secret.starts_with("llm-"));
        assert_eq!(fx.ctx.keys.validate(&secret).unwrap(), Some(key_id));

        fx.ctx.keys.record_usage(key_id, "/v1/completions", 3, 4).unwrap();

        let resp = send(&fx.ctx, json!({"cmd": "set_key_status", "key_id": key_id, "status": "revoked"})).await;
        assert!(resp.ok);
        assert_eq!(fx.ctx.keys.validate(&secret).unwrap(), None);

        send(&fx.ctx, json!({"cmd": "activate_key", "key_id": key_id})).await;
        assert_eq!(fx.ctx.keys.validate(&secret).unwrap(), Some(key_id));

        let resp = send(&fx.ctx, json!({"cmd": "delete_key", "key_id": key_id})).await;
        assert!(resp.ok);
        let resp = send(&fx.ctx, json!({"cmd": "activate_key", "key_id": key_id})).await;
        assert!(!resp.ok);

        let count = |filter: &str| {
            let ctx = fx.ctx.clone();
            let filter = filter.to_string();
            async move {
                let data = send(&ctx, json!({"cmd": "list_keys", "status_filter": filter}))
                    .await
                    .data
                    .unwrap();
                data.as_array().unwrap().len()
            }
        };
        assert_eq!(count("deleted").await, 1);
        assert_eq!(count("active").await, 0);
        assert_eq!(count("all").await, 0);

        let usage = send(&fx.ctx, json!({"cmd": "key_usage", "key_id": key_id})).await.data.unwrap();
        assert_eq!(usage[0]["requests"], 1);
        assert_eq!(usage[0]["total_tokens"], 7);

        let history = send(&fx.ctx, json!({"cmd": "key_usage_history", "key_id": key_id}))
            .await
            .data
            .unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);

        let resp = send(&fx.ctx, json!({"cmd": "set_key_status", "key_id": key_id, "status": "bogus"})).await;
        assert!(!resp.ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_generate_during_load_never_mixes_models() {
        let fx = fixture_with(MockBackends::with_delay(Duration::from_millis(100)));
        let other = ModelCache::new(fx.dir.path().join("models")).snapshot_dir("test/other-model", "rev2");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join("model.gguf"), b"GGUF").unwrap();

        send(&fx.ctx, json!({"cmd": "load_model", "model_id": "test/tiny-model"})).await;

        let ctx = fx.ctx.clone();
        let load = tokio::spawn(async move {
            send(&ctx, json!({"cmd": "load_model", "model_id": "test/other-model"})).await
        });
        let ctx = fx.ctx.clone();
        let gen = tokio::spawn(async move { send(&ctx, json!({"cmd": "generate", "prompt": "a b"})).await });

        let load = load.await.unwrap();
        let gen = gen.await.unwrap();
        assert!(load.ok);
        if gen.ok {
            let text = gen.data.unwrap()["text"].as_str().unwrap().to_string();
            assert!(text.starts_with("[rev1]") || text.starts_with("[rev2]"));
            assert_eq!(text.matches("[rev").count(), 1);
        }
        assert_eq!(
            fx.backends.stats.max_resident.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_list_and_delete_models() {
        let fx = fixture();
        send(&fx.ctx, json!({"cmd": "load_model", "model_id": "test/tiny-model"})).await;

        let models = send(&fx.ctx, json!({"cmd": "list_models"})).await.data.unwrap();
        assert_eq!(models[0]["repo_id"], "test/tiny-model");
        assert_eq!(models[0]["is_loaded"], true);
        assert_eq!(models[0]["backend"], "transformers");

        let size = send(&fx.ctx, json!({"cmd": "cache_size"})).await.data.unwrap();
        assert!(size["bytes"].as_u64().unwrap() > 0);

        let resp = send(&fx.ctx, json!({"cmd": "delete_model", "model_id": "test/tiny-model"})).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert!(!fx.ctx.engine().is_loaded());

        let models = send(&fx.ctx, json!({"cmd": "list_models"})).await.data.unwrap();
        assert!(models.as_array().unwrap().is_empty());

        let resp = send(&fx.ctx, json!({"cmd": "delete_model", "model_id": "test/tiny-model"})).await;
        assert!(!resp.ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_then_load() {
        let fx = fixture();
        fx.hub.add_repo(
            "acme/small",
            "abc123",
            &[("config.json", 10), ("weights.gguf", 64)],
        );

        let files = send(&fx.ctx, json!({"cmd": "list_repo_files", "model_id": "acme/small"}))
            .await
            .data
            .unwrap();
        assert_eq!(files.as_array().unwrap().len(), 2);

        let resp = send(&fx.ctx, json!({"cmd": "download_model", "model_id": "acme/small"})).await;
        assert!(resp.ok, "{:?}", resp.error);

        let mut phase = Value::Null;
        for _ in 0..200 {
            let status = send(&fx.ctx, json!({"cmd": "download_status"})).await.data.unwrap();
            phase = status["phase"].clone();
            if phase == "completed" || phase == "error" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(phase, "completed");

        let resp = send(&fx.ctx, json!({"cmd": "load_model", "model_id": "acme/small"})).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.data.unwrap()["backend"], "llama.cpp");
    }

    #[tokio::test]
    async fn test_hub_token_and_search() {
        let fx = fixture();
        fx.hub.add_repo("acme/llama-tiny", "s1", &[("a.gguf", 1)]);

        let resp = send(&fx.ctx, json!({"cmd": "set_hf_token", "token": "bad"})).await;
        assert!(resp.error.unwrap().starts_with("Login failed"));
        assert!(fx.ctx.config().hf_token.is_none());

        let resp = send(&fx.ctx, json!({"cmd": "set_hf_token", "token": "hf_good"})).await;
        assert_eq!(resp.data.unwrap()["username"], "tester");
        assert_eq!(fx.hub.token.lock().as_deref(), Some("hf_good"));

        let status = send(&fx.ctx, json!({"cmd": "hf_status"})).await.data.unwrap();
        assert_eq!(status["logged_in"], true);

        let resp = send(&fx.ctx, json!({"cmd": "set_hf_token", "token": ""})).await;
        assert_eq!(resp.data.unwrap()["logged_in"], false);
        assert!(fx.ctx.config().hf_token.is_none());

        let hits = send(&fx.ctx, json!({"cmd": "search_models", "query": "llama"})).await.data.unwrap();
        assert_eq!(hits[0]["id"], "acme/llama-tiny");
        assert!(!send(&fx.ctx, json!({"cmd": "search_models"})).await.ok);
    }

    #[tokio::test]
    async fn test_settings_commands() {
        let fx = fixture();

        let resp = send(&fx.ctx, json!({"cmd": "set_server_port", "port": 80})).await;
        assert!(!resp.ok);
        let resp = send(&fx.ctx, json!({"cmd": "set_server_port", "port": 9123})).await;
        assert_eq!(resp.data.unwrap()["restarted"], false);
        assert_eq!(fx.ctx.config().port, 9123);

        let resp = send(&fx.ctx, json!({"cmd": "set_auto_restore", "enabled": false})).await;
        assert_eq!(resp.data.unwrap()["auto_restore"], false);

        let resp = send(&fx.ctx, json!({"cmd": "set_log_level", "level": "debug"})).await;
        assert_eq!(resp.data.unwrap()["log_level"], "DEBUG");
        assert!(!send(&fx.ctx, json!({"cmd": "set_log_level", "level": "loud"})).await.ok);

        let new_dir = fx.dir.path().join("elsewhere/models");
        let resp = send(&fx.ctx, json!({"cmd": "set_model_dir", "path": new_dir})).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert!(new_dir.is_dir());
        let resp = send(&fx.ctx, json!({"cmd": "load_model", "model_id": "test/tiny-model"})).await;
        assert!(!resp.ok);

        let file = fx.dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();
        let resp = send(&fx.ctx, json!({"cmd": "set_model_dir", "path": file})).await;
        assert_eq!(resp.error.as_deref(), Some("Path is not a directory"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let fx = fixture();
        let resp = send(&fx.ctx, json!({"cmd": "start_server"})).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert!(fx.ctx.config().server_was_running);

        let resp = send(&fx.ctx, json!({"cmd": "start_server"})).await;
        assert_eq!(resp.error.as_deref(), Some("Server is already running"));

        let status = send(&fx.ctx, json!({"cmd": "get_status"})).await.data.unwrap();
        assert_eq!(status["server_running"], true);

        assert!(send(&fx.ctx, json!({"cmd": "stop_server"})).await.ok);
        assert!(!fx.ctx.config().server_was_running);
    }

    #[tokio::test]
    async fn test_auto_restore_clears_missing_model() {
        let fx = fixture();
        fx.ctx
            .config
            .update(|c| c.active_model = "gone/model".to_string())
            .unwrap();
        fx.ctx.auto_restore().await;
        assert!(!fx.ctx.engine().is_loaded());
        assert_eq!(fx.ctx.config().active_model, "");

        fx.ctx
            .config
            .update(|c| c.active_model = "test/tiny-model".to_string())
            .unwrap();
        fx.ctx.auto_restore().await;
        assert!(fx.ctx.engine().is_loaded());
    }

    #[tokio::test]
    async fn test_shutdown_acknowledges_first() {
        let fx = fixture();
        let mut signal = fx.ctx.shutdown_signal();

        let resp = send(&fx.ctx, json!({"cmd": "shutdown"})).await;
        assert!(resp.ok);
        assert!(!*signal.borrow());

        tokio::time::timeout(Duration::from_secs(2), signal.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*signal.borrow());

        fx.ctx.stop_services().await;
        assert_eq!(fx.ctx.phase(), DaemonPhase::Stopping);
    }
}
