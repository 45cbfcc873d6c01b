//! Control protocol
//!
//! One newline-terminated JSON object per connection in each direction.
//! Requests are `{"cmd": "<name>", ...args}`; responses are
//! `{"ok": true, "data": ...}` or `{"ok": false, "error": "..."}`.

use crate::types::config::TuningUpdate;
use crate::types::message::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_key_name() -> String {
    "unnamed".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Ping,
    GetStatus,

    // Gateway
    StartServer,
    StopServer,
    SetServerPort {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        host: Option<String>,
    },

    // Model slot
    LoadModel {
        #[serde(default)]
        model_id: String,
        #[serde(default)]
        backend: Option<String>,
    },
    SwitchBackend {
        #[serde(default)]
        backend: String,
    },
    UnloadModel,
    ModelStatus,
    DeviceInfo,

    // Local cache and hub
    ListModels,
    SearchModels {
        #[serde(default)]
        query: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    DeleteModel {
        #[serde(default)]
        model_id: String,
    },
    CacheSize,
    ListRepoFiles {
        #[serde(default)]
        model_id: String,
    },
    DownloadModel {
        #[serde(default)]
        model_id: String,
        #[serde(default)]
        filenames: Option<Vec<String>>,
    },
    DownloadStatus,
    CancelDownload,

    // API keys
    ListKeys {
        #[serde(default)]
        status_filter: Option<String>,
    },
    AddKey {
        #[serde(default = "default_key_name")]
        name: String,
        #[serde(default)]
        expires_in_days: Option<u32>,
    },
    SetKeyStatus {
        key_id: i64,
        status: String,
    },
    RevokeKey {
        key_id: i64,
    },
    ActivateKey {
        key_id: i64,
    },
    DeleteKey {
        key_id: i64,
    },
    KeyCount,
    KeyUsage {
        #[serde(default)]
        key_id: Option<i64>,
    },
    KeyUsageHistory {
        key_id: i64,
        #[serde(default)]
        limit: Option<usize>,
    },

    // Configuration
    GetConfig,
    SetTuning(TuningUpdate),
    ResetTuning,
    SetHfToken {
        #[serde(default)]
        token: String,
    },
    HfStatus,
    SetAutoRestore {
        #[serde(default)]
        enabled: Option<bool>,
    },
    SetModelDir {
        #[serde(default)]
        path: String,
    },
    SetLogLevel {
        #[serde(default = "default_log_level")]
        level: String,
    },

    // Generation
    Generate {
        #[serde(default)]
        prompt: String,
    },
    ChatGenerate {
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },

    Shutdown,
}

impl Command {
    /// Every command name the daemon understands
    pub const NAMES: &'static [&'static str] = &[
        "ping",
        "get_status",
        "start_server",
        "stop_server",
        "set_server_port",
        "load_model",
        "switch_backend",
        "unload_model",
        "model_status",
        "device_info",
        "list_models",
        "search_models",
        "delete_model",
        "cache_size",
        "list_repo_files",
        "download_model",
        "download_status",
        "cancel_download",
        "list_keys",
        "add_key",
        "set_key_status",
        "revoke_key",
        "activate_key",
        "delete_key",
        "key_count",
        "key_usage",
        "key_usage_history",
        "get_config",
        "set_tuning",
        "reset_tuning",
        "set_hf_token",
        "hf_status",
        "set_auto_restore",
        "set_model_dir",
        "set_log_level",
        "generate",
        "chat_generate",
        "shutdown",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::GetStatus => "get_status",
            Command::StartServer => "start_server",
            Command::StopServer => "stop_server",
            Command::SetServerPort { .. } => "set_server_port",
            Command::LoadModel { .. } => "load_model",
            Command::SwitchBackend { .. } => "switch_backend",
            Command::UnloadModel => "unload_model",
            Command::ModelStatus => "model_status",
            Command::DeviceInfo => "device_info",
            Command::ListModels => "list_models",
            Command::SearchModels { .. } => "search_models",
            Command::DeleteModel { .. } => "delete_model",
            Command::CacheSize => "cache_size",
            Command::ListRepoFiles { .. } => "list_repo_files",
            Command::DownloadModel { .. } => "download_model",
            Command::DownloadStatus => "download_status",
            Command::CancelDownload => "cancel_download",
            Command::ListKeys { .. } => "list_keys",
            Command::AddKey { .. } => "add_key",
            Command::SetKeyStatus { .. } => "set_key_status",
            Command::RevokeKey { .. } => "revoke_key",
            Command::ActivateKey { .. } => "activate_key",
            Command::DeleteKey { .. } => "delete_key",
            Command::KeyCount => "key_count",
            Command::KeyUsage { .. } => "key_usage",
            Command::KeyUsageHistory { .. } => "key_usage_history",
            Command::GetConfig => "get_config",
            Command::SetTuning(_) => "set_tuning",
            Command::ResetTuning => "reset_tuning",
            Command::SetHfToken { .. } => "set_hf_token",
            Command::HfStatus => "hf_status",
            Command::SetAutoRestore { .. } => "set_auto_restore",
            Command::SetModelDir { .. } => "set_model_dir",
            Command::SetLogLevel { .. } => "set_log_level",
            Command::Generate { .. } => "generate",
            Command::ChatGenerate { .. } => "chat_generate",
            Command::Shutdown => "shutdown",
        }
    }

    /// Parse one request line.
    ///
    /// Unknown names and malformed arguments come back as the error text
    /// the caller should see.
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(line.trim()).map_err(|e| format!("Malformed request: {}", e))?;
        Self::from_value(value)
    }

    /// Build a command from a JSON object, with the same checks as [`Command::parse`]
    pub fn from_value(value: Value) -> Result<Self, String> {
        let name = match value.get("cmd") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => return Err("Malformed request: \"cmd\" must be a string".to_string()),
            None => return Err("Malformed request: missing \"cmd\"".to_string()),
        };
        if !Self::NAMES.contains(&name.as_str()) {
            return Err(format!("Unknown command: {}", name));
        }
        serde_json::from_value(value).map_err(|e| format!("Invalid arguments for {}: {}", name, e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: (!data.is_null()).then_some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Newline-terminated wire form
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"Internal daemon error"}"#.to_string());
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(r#"{"cmd":"ping"}"#), Ok(Command::Ping));
        assert_eq!(
            Command::parse(r#"{"cmd":"load_model","model_id":"a/b","backend":"llama.cpp"}"#),
            Ok(Command::LoadModel {
                model_id: "a/b".to_string(),
                backend: Some("llama.cpp".to_string()),
            })
        );
        assert_eq!(
            Command::parse(r#"{"cmd":"add_key"}"#),
            Ok(Command::AddKey {
                name: "unnamed".to_string(),
                expires_in_days: None,
            })
        );

        match Command::parse(r#"{"cmd":"set_tuning","top_k":12,"do_sample":false}"#) {
            Ok(Command::SetTuning(update)) => {
                assert_eq!(update.top_k, Some(12));
                assert_eq!(update.do_sample, Some(false));
                assert_eq!(update.temperature, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unit_commands_ignore_extra_fields() {
        assert_eq!(
            Command::parse(r#"{"cmd":"get_status","verbose":true}"#),
            Ok(Command::GetStatus)
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        let err = Command::parse(r#"{"cmd":"make_coffee"}"#).unwrap_err();
        assert!(err.to_lowercase().contains("unknown command"));

        assert!(Command::parse("not json").unwrap_err().contains("Malformed"));
        assert!(Command::parse(r#"{"prompt":"hi"}"#).unwrap_err().contains("cmd"));

        let err = Command::parse(r#"{"cmd":"set_key_status","key_id":"x"}"#).unwrap_err();
        assert!(err.starts_with("Invalid arguments for set_key_status"));
    }

    #[test]
    fn test_names_cover_every_variant() {
        let samples = [
            Command::Ping,
            Command::SetTuning(TuningUpdate::default()),
            Command::KeyUsageHistory {
                key_id: 1,
                limit: None,
            },
            Command::Shutdown,
        ];
        for cmd in samples {
            assert!(Command::NAMES.contains(&cmd.name()));
            let value = serde_json::to_value(&cmd).unwrap();
            assert_eq!(value["cmd"], cmd.name());
        }
    }

    #[test]
    fn test_response_shape() {
        assert_eq!(Response::ok(json!("pong")).to_line(), "{\"ok\":true,\"data\":\"pong\"}\n");
        assert_eq!(Response::ok(Value::Null).to_line(), "{\"ok\":true}\n");
        assert_eq!(
            Response::error("boom").to_line(),
            "{\"ok\":false,\"error\":\"boom\"}\n"
        );
    }
}
