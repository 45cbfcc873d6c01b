//! OpenAI-compatible HTTP gateway
//!
//! Runs as its own task inside the daemon. Generation goes through the shared
//! [`Engine`], so a request holds the model lock for as long as it generates.

pub mod auth;
pub mod openai;

use crate::inference::{Engine, InferenceError};
use crate::storage::keys::KeyStore;
use crate::storage::settings::ConfigStore;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use openai::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    ModelList, Usage,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

pub const ENDPOINTS: [&str; 4] = ["/health", "/v1/models", "/v1/completions", "/v1/chat/completions"];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("Invalid API key")]
    Forbidden,

    #[error("No model loaded")]
    NoModel,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NoModel => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) | ApiError::Forbidden => "authentication_error",
            ApiError::NoModel => "service_unavailable",
            ApiError::BadRequest(_) => "invalid_request_error",
            ApiError::Internal(_) => "server_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<InferenceError> for ApiError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::NotLoaded => ApiError::NoModel,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

/// Everything a request handler needs
#[derive(Clone)]
pub struct GatewayState {
    pub engine: Engine,
    pub keys: Arc<dyn KeyStore>,
    pub config: Arc<ConfigStore>,
}

pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(cors)
        .with_state(state)
}

async fn root(State(state): State<GatewayState>) -> Json<Value> {
    let status = state.engine.status();
    Json(json!({
        "name": "llmd",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "model_loaded": status.loaded,
        "model_id": status.model_id,
        "endpoints": ENDPOINTS,
    }))
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let status = state.engine.status();
    Json(json!({
        "status": "ok",
        "model_loaded": status.loaded,
        "model_id": status.model_id,
    }))
}

async fn list_models(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<ModelList>, ApiError> {
    auth::authorize(&state.keys, &headers).await?;
    Ok(Json(ModelList::single(state.engine.status().model_id)))
}

async fn completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let key_id = auth::authorize(&state.keys, &headers).await?;
    let Json(req) = body?;
    if !state.engine.is_loaded() {
        return Err(ApiError::NoModel);
    }

    let params = req
        .sampling
        .resolve(&state.config.get().tuning)
        .map_err(ApiError::BadRequest)?;
    // The model that serves this request, even if a swap lands mid-generation
    let model = state.engine.status().model_id.unwrap_or_default();
    let text = state.engine.generate(req.prompt.clone(), params).await?;

    let usage = Usage::estimate(&req.prompt, &text);
    record_usage(&state, key_id, "/v1/completions", usage).await;

    Ok(Json(CompletionResponse::new(model, text, usage)))
}

async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    let key_id = auth::authorize(&state.keys, &headers).await?;
    let Json(req) = body?;
    if !state.engine.is_loaded() {
        return Err(ApiError::NoModel);
    }

    let params = req
        .sampling
        .resolve(&state.config.get().tuning)
        .map_err(ApiError::BadRequest)?;
    let model = state.engine.status().model_id.unwrap_or_default();
    let prompt_text = req
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let text = state.engine.chat_generate(req.messages, params).await?;

    let usage = Usage::estimate(&prompt_text, &text);
    record_usage(&state, key_id, "/v1/chat/completions", usage).await;

    Ok(Json(ChatCompletionResponse::new(model, text, usage)))
}

/// Metering never fails the request
async fn record_usage(state: &GatewayState, key_id: i64, endpoint: &'static str, usage: Usage) {
    let keys = state.keys.clone();
    let result = tokio::task::spawn_blocking(move || {
        keys.record_usage(key_id, endpoint, usage.prompt_tokens, usage.completion_tokens)
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(key_id, endpoint, error = %e, "Failed to record usage"),
        Err(e) => tracing::warn!(key_id, endpoint, error = %e, "Usage recording task failed"),
    }
}

/// A running gateway
pub struct GatewayHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Bind and start serving in a background task
    pub async fn start(state: GatewayState, host: &str, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "HTTP gateway failed");
            }
        });

        tracing::info!(%addr, "HTTP gateway started");
        Ok(Self {
            addr,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting, let in-flight requests finish for a few seconds, then abort
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let abort = self.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .is_err()
        {
            tracing::warn!(addr = %self.addr, "HTTP gateway did not stop in time, aborting");
            abort.abort();
        }
        tracing::info!(addr = %self.addr, "HTTP gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::MockBackends;
    use crate::inference::LoadOptions;
    use crate::storage::cache::ModelCache;
    use crate::storage::keys::{KeyStatus, KeyStoreError, SqliteKeyStore};
    use crate::types::model::BackendChoice;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        state: GatewayState,
        store: Arc<SqliteKeyStore>,
        secret: String,
        key_id: i64,
    }

    async fn fixture(load: bool) -> Fixture {
        fixture_with(MockBackends::default(), load).await
    }

    async fn fixture_with(backends: MockBackends, load: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path().join("cache"));
        let snap = cache.snapshot_dir("test/tiny-model", "rev1");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("model.safetensors"), b"x").unwrap();

        let engine = Engine::new(Arc::new(backends), cache, LoadOptions::default());
        if load {
            engine
                .load_model("test/tiny-model", BackendChoice::Auto)
                .await
                .unwrap();
        }

        let store = Arc::new(SqliteKeyStore::open_in_memory().unwrap());
        let key = store.add_key("tester", None).unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")));

        Fixture {
            state: GatewayState {
                engine,
                keys: store.clone(),
                config,
            },
            store,
            secret: key.key,
            key_id: key.id,
            _dir: dir,
        }
    }

    fn post_json(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(secret) = auth {
            builder = builder.header("authorization", format!("Bearer {}", secret));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let fx = fixture(true).await;
        let resp = router(fx.state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["model_id"], "test/tiny-model");
    }

    #[tokio::test]
    async fn test_missing_and_malformed_credentials() {
        let fx = fixture(true).await;
        let app = router(fx.state);

        let resp = app
            .clone()
            .oneshot(post_json("/v1/completions", None, json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"]["code"], 401);

        let req = Request::get("/v1/models")
            .header("authorization", "Token abc")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_and_revoked_keys_are_forbidden() {
        let fx = fixture(true).await;
        let app = router(fx.state);

        let resp = app
            .clone()
            .oneshot(post_json("/v1/completions", Some("llm-nope"), json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        fx.store.set_status(fx.key_id, KeyStatus::Revoked).unwrap();
        let resp = app
            .oneshot(post_json("/v1/completions", Some(&fx.secret), json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_no_model_is_unavailable() {
        let fx = fixture(false).await;
        let resp = router(fx.state)
            .oneshot(post_json(
                "/v1/chat/completions",
                Some(&fx.secret),
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_completion_records_usage() {
        let fx = fixture(true).await;
        let resp = router(fx.state.clone())
            .oneshot(post_json(
                "/v1/completions",
                Some(&fx.secret),
                json!({"prompt": "say hello world", "max_tokens": 9}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["object"], "text_completion");
        assert_eq!(body["model"], "test/tiny-model");
        let text = body["choices"][0]["text"].as_str().unwrap();
        assert!(text.contains("max_tokens=9"));
        assert_eq!(body["usage"]["prompt_tokens"], 3);

        let history = fx.store.usage_history(fx.key_id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].endpoint, "/v1/completions");
        assert_eq!(history[0].prompt_tokens, 3);
    }

    #[tokio::test]
    async fn test_chat_completion_uses_server_tuning() {
        let fx = fixture(true).await;
        fx.state
            .config
            .update(|c| c.tuning.max_tokens = 21)
            .unwrap();

        let resp = router(fx.state)
            .oneshot(post_json(
                "/v1/chat/completions",
                Some(&fx.secret),
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        let content = body["choices"][0]["message"]["content"].as_str().unwrap();
        assert!(content.contains("max_tokens=21"));
    }

    #[tokio::test]
    async fn test_out_of_range_sampling_is_rejected() {
        let fx = fixture(true).await;
        let app = router(fx.state);

        for overrides in [
            json!({"temperature": -5}),
            json!({"top_p": 7}),
            json!({"max_tokens": 0}),
            json!({"max_tokens": 1_000_000}),
            json!({"top_k": 4_294_967_295u64}),
        ] {
            let mut completion = json!({"prompt": "hi"});
            let mut chat = json!({"messages": [{"role": "user", "content": "hi"}]});
            for (k, v) in overrides.as_object().unwrap() {
                completion[k] = v.clone();
                chat[k] = v.clone();
            }

            for (uri, body) in [("/v1/completions", completion), ("/v1/chat/completions", chat)] {
                let resp = app
                    .clone()
                    .oneshot(post_json(uri, Some(&fx.secret), body))
                    .await
                    .unwrap();
                assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{} {}", uri, overrides);
                let body = body_json(resp).await;
                assert_eq!(body["error"]["code"], 400);
            }
        }

        assert!(fx.store.usage_history(fx.key_id, 10).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_model_field_names_the_serving_model() {
        let fx = fixture_with(MockBackends::with_delay(Duration::from_millis(400)), true).await;
        let engine = fx.state.engine.clone();
        let app = router(fx.state);

        let request = tokio::spawn(app.oneshot(post_json(
            "/v1/completions",
            Some(&fx.secret),
            json!({"prompt": "hi"}),
        )));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Queued behind the running generation
        let unload = tokio::spawn(async move { engine.unload().await });

        let resp = request.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["model"], "test/tiny-model");
        assert!(unload.await.unwrap().unwrap());
    }

    /// Validates everything, fails every usage write
    struct BrokenMeter;

    impl KeyStore for BrokenMeter {
        fn validate(&self, _secret: &str) -> Result<Option<i64>, KeyStoreError> {
            Ok(Some(1))
        }

        fn record_usage(&self, _: i64, _: &str, _: u32, _: u32) -> Result<(), KeyStoreError> {
            Err(KeyStoreError::NotFound(1))
        }
    }

    #[tokio::test]
    async fn test_usage_failure_does_not_fail_request() {
        let mut fx = fixture(true).await;
        fx.state.keys = Arc::new(BrokenMeter);

        let resp = router(fx.state)
            .oneshot(post_json("/v1/completions", Some("anything"), json!({"prompt": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_handle_start_stop() {
        let fx = fixture(false).await;
        let handle = GatewayHandle::start(fx.state, "127.0.0.1", 0).await.unwrap();
        assert!(handle.is_running());
        assert_ne!(handle.addr().port(), 0);
        handle.stop().await;
    }
}
