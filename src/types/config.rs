//! Configuration types
//!
//! Server configuration and generation tuning structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest accepted `top_k`; the quantized runner takes it as an `i32`
pub const MAX_TOP_K: u32 = i32::MAX as u32;

/// Generation hyperparameters applied to every request that does not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningProfile {
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Penalty applied to recently generated tokens (1.0 = off)
    pub repetition_penalty: f32,
    /// Sample from the distribution; greedy decoding when false
    pub do_sample: bool,
}

impl Default for TuningProfile {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            max_tokens: 512,
            repetition_penalty: 1.1,
            do_sample: true,
        }
    }
}

impl TuningProfile {
    /// Clamp every field into its accepted range.
    ///
    /// Used for values read back from disk, where a hand-edited file should
    /// degrade to something usable rather than fail the daemon.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 50;
        }
        self.top_k = self.top_k.min(MAX_TOP_K);

        self.max_tokens = self.max_tokens.clamp(1, 65536);

        if !(self.repetition_penalty > 0.0) {
            self.repetition_penalty = 1.1;
        }
    }
}

/// Partial tuning update; `None` fields keep their current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningUpdate {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub do_sample: Option<bool>,
}

impl TuningUpdate {
    /// Check ranges without touching the profile
    pub fn check(&self) -> Result<(), String> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature must be within 0.0-2.0, got {}", t));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("top_p must be within 0.0-1.0, got {}", p));
            }
        }
        if let Some(k) = self.top_k {
            if k == 0 || k > MAX_TOP_K {
                return Err(format!("top_k must be within 1-{}, got {}", MAX_TOP_K, k));
            }
        }
        if let Some(m) = self.max_tokens {
            if !(1..=65536).contains(&m) {
                return Err(format!("max_tokens must be within 1-65536, got {}", m));
            }
        }
        if let Some(r) = self.repetition_penalty {
            if !(r > 0.0) {
                return Err(format!("repetition_penalty must be positive, got {}", r));
            }
        }
        Ok(())
    }

    /// Overlay the supplied fields onto `base`
    pub fn apply_to(&self, base: &TuningProfile) -> TuningProfile {
        TuningProfile {
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            top_k: self.top_k.unwrap_or(base.top_k),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            repetition_penalty: self.repetition_penalty.unwrap_or(base.repetition_penalty),
            do_sample: self.do_sample.unwrap_or(base.do_sample),
        }
    }
}

/// Daemon configuration persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the HTTP gateway
    pub host: String,
    /// Port of the HTTP gateway
    pub port: u16,
    /// Model id to restore on startup (empty = none)
    pub active_model: String,
    /// Whether the gateway was running when the daemon last stopped
    pub server_was_running: bool,
    /// Restore the previous model and gateway on startup
    pub auto_restore: bool,
    /// Override for the model cache root
    pub model_dir: Option<PathBuf>,
    /// Hub access token
    pub hf_token: Option<String>,
    /// DEBUG, INFO, WARNING or ERROR
    pub log_level: String,
    pub tuning: TuningProfile,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            active_model: String::new(),
            server_was_running: false,
            auto_restore: true,
            model_dir: None,
            hf_token: None,
            log_level: "INFO".to_string(),
            tuning: TuningProfile::default(),
        }
    }
}

pub const LOG_LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARNING", "ERROR"];

impl ServerConfig {
    /// Ensure all values are within acceptable ranges
    pub fn validate(&mut self) {
        self.tuning.validate();

        // 0 binds an ephemeral port
        if self.port != 0 && self.port < 1024 {
            self.port = 8000;
        }

        if self.host.trim().is_empty() {
            self.host = "127.0.0.1".to_string();
        }

        self.log_level = self.log_level.to_uppercase();
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            self.log_level = "INFO".to_string();
        }

        if self.hf_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.hf_token = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert!(config.auto_restore);
        assert!(config.model_dir.is_none());
        assert_eq!(config.tuning.top_k, 50);
        assert_eq!(config.tuning.max_tokens, 512);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();
        config.tuning.temperature = 5.0;
        config.tuning.top_p = -1.0;
        config.tuning.top_k = 0;
        config.port = 80;
        config.log_level = "verbose".to_string();
        config.validate();

        assert_eq!(config.tuning.temperature, 2.0);
        assert_eq!(config.tuning.top_p, 0.0);
        assert_eq!(config.tuning.top_k, 50);
        assert_eq!(config.port, 8000);
        assert_eq!(config.log_level, "INFO");
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 9001, "tuning": {"top_k": 7}}"#).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.tuning.top_k, 7);
        assert_eq!(config.tuning.temperature, 0.7);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_update_keeps_omitted_fields() {
        let base = TuningProfile::default();
        let update = TuningUpdate {
            top_k: Some(12),
            do_sample: Some(false),
            ..Default::default()
        };
        let merged = update.apply_to(&base);
        assert_eq!(merged.top_k, 12);
        assert!(!merged.do_sample);
        assert_eq!(merged.temperature, base.temperature);
        assert_eq!(merged.max_tokens, base.max_tokens);
    }

    #[test]
    fn test_update_rejects_out_of_range() {
        let update = TuningUpdate {
            temperature: Some(3.5),
            ..Default::default()
        };
        assert!(update.check().is_err());

        let update = TuningUpdate {
            repetition_penalty: Some(0.0),
            ..Default::default()
        };
        assert!(update.check().is_err());

        assert!(TuningUpdate::default().check().is_ok());
    }
}
