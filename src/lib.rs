//! llmd
//!
//! Local LLM serving daemon: one resident model behind a unix-socket control
//! protocol and an OpenAI-compatible HTTP gateway, with a resumable hub
//! downloader and an API-key store.

pub mod daemon;
pub mod download;
pub mod gateway;
pub mod inference;
pub mod storage;
pub mod system;
pub mod types;
