//! Model execution
//!
//! Backends, the router that holds the resident model and the engine that
//! serializes every model call behind one lock.

pub mod backend;
pub mod candle;
pub mod engine;
pub mod llama;
#[cfg(test)]
pub mod mock;
pub mod router;

pub use backend::{Backend, BackendError, BackendFactory, LoadOptions, NativeBackends};
pub use engine::Engine;
pub use router::InferenceRouter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Model not found locally: {0}")]
    ModelNotFound(String),

    #[error(transparent)]
    Backend(BackendError),

    #[error("Inference task failed: {0}")]
    Task(String),
}
