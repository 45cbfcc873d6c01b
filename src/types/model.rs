//! Model types
//!
//! Backend identifiers, device descriptors and the published model status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Concrete model-execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Single-file quantized weights (GGUF) through llama.cpp
    #[serde(rename = "llama.cpp")]
    LlamaCpp,
    /// Full-precision tokenizer + safetensors weights
    #[serde(rename = "transformers")]
    Transformers,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LlamaCpp => "llama.cpp",
            BackendKind::Transformers => "transformers",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llama.cpp" | "llamacpp" | "llama_cpp" | "gguf" => Ok(BackendKind::LlamaCpp),
            "transformers" | "safetensors" => Ok(BackendKind::Transformers),
            other => Err(format!(
                "Invalid backend: {:?} (expected \"transformers\" or \"llama.cpp\")",
                other
            )),
        }
    }
}

/// Backend selection requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Detect from the model files
    #[default]
    Auto,
    Forced(BackendKind),
}

impl BackendChoice {
    /// Parse an optional backend argument; absent or "auto" means detection
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value.map(str::trim) {
            None | Some("") | Some("auto") => Ok(BackendChoice::Auto),
            Some(name) => name.parse().map(BackendChoice::Forced),
        }
    }
}

/// Compute device the model runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// "CUDA", "Metal", "Vulkan" or "CPU"
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    /// Human-readable memory size, "—" when unknown
    pub memory: String,
}

impl DeviceInfo {
    pub fn cpu() -> Self {
        Self {
            device_type: "CPU".to_string(),
            name: "—".to_string(),
            memory: "—".to_string(),
        }
    }
}

/// Snapshot of the model slot, readable without taking the model lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub loaded: bool,
    /// Human-facing id (hub repo id or the path the caller gave)
    pub model_id: Option<String>,
    pub backend: Option<BackendKind>,
    /// Resolved local file or directory
    pub local_path: Option<String>,
    pub device: Option<DeviceInfo>,
}

impl ModelStatus {
    pub fn empty() -> Self {
        Self {
            loaded: false,
            model_id: None,
            backend: None,
            local_path: None,
            device: None,
        }
    }
}

impl Default for ModelStatus {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert_eq!("llama.cpp".parse::<BackendKind>(), Ok(BackendKind::LlamaCpp));
        assert_eq!(" Transformers ".parse::<BackendKind>(), Ok(BackendKind::Transformers));
        assert!("onnx".parse::<BackendKind>().is_err());
        assert_eq!(
            serde_json::to_string(&BackendKind::LlamaCpp).unwrap(),
            "\"llama.cpp\""
        );
    }

    #[test]
    fn test_backend_choice() {
        assert_eq!(BackendChoice::parse(None), Ok(BackendChoice::Auto));
        assert_eq!(BackendChoice::parse(Some("auto")), Ok(BackendChoice::Auto));
        assert_eq!(
            BackendChoice::parse(Some("transformers")),
            Ok(BackendChoice::Forced(BackendKind::Transformers))
        );
        assert!(BackendChoice::parse(Some("tensorrt")).is_err());
    }
}
