//! Deterministic backends for tests

use super::backend::{Backend, BackendError, BackendFactory, LoadOptions};
use crate::types::config::TuningProfile;
use crate::types::message::{flatten_chat, ChatMessage};
use crate::types::model::{BackendKind, DeviceInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared counters across every backend a factory hands out
#[derive(Debug, Default)]
pub struct MockStats {
    pub loads: AtomicUsize,
    pub resident: AtomicUsize,
    pub max_resident: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockBackends {
    pub delay: Duration,
    pub stats: Arc<MockStats>,
    /// Backends of this kind refuse every load
    pub fail_kind: Option<BackendKind>,
}

impl MockBackends {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

impl BackendFactory for MockBackends {
    fn create(&self, kind: BackendKind) -> Box<dyn Backend> {
        Box::new(MockBackend {
            kind,
            delay: self.delay,
            stats: self.stats.clone(),
            fails: self.fail_kind == Some(kind),
            loaded: None,
        })
    }
}

pub struct MockBackend {
    kind: BackendKind,
    delay: Duration,
    stats: Arc<MockStats>,
    fails: bool,
    loaded: Option<PathBuf>,
}

impl MockBackend {
    /// Last path component of the loaded model, used to tag output
    fn tag(&self) -> Result<String, BackendError> {
        let path = self.loaded.as_ref().ok_or(BackendError::NotLoaded)?;
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn load(&mut self, path: &Path, _options: &LoadOptions) -> Result<(), BackendError> {
        self.unload();
        if !path.exists() {
            return Err(BackendError::NotFound(path.display().to_string()));
        }
        if self.fails {
            return Err(BackendError::Load(format!("{} refuses to load", self.kind)));
        }
        std::thread::sleep(self.delay);

        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.resident.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_resident.fetch_max(now, Ordering::SeqCst);
        self.loaded = Some(path.to_path_buf());
        Ok(())
    }

    fn unload(&mut self) {
        if self.loaded.take().is_some() {
            self.stats.resident.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::cpu()
    }

    fn generate(&mut self, prompt: &str, params: &TuningProfile) -> Result<String, BackendError> {
        let tag = self.tag()?;
        std::thread::sleep(self.delay);
        Ok(format!(
            "[{}] {} (max_tokens={})",
            tag,
            prompt.split_whitespace().rev().collect::<Vec<_>>().join(" "),
            params.max_tokens
        ))
    }

    fn chat_generate(
        &mut self,
        messages: &[ChatMessage],
        params: &TuningProfile,
    ) -> Result<String, BackendError> {
        self.generate(&flatten_chat(messages), params)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.unload();
    }
}
