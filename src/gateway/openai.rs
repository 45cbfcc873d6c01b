//! OpenAI-compatible request and response bodies

use crate::types::config::{TuningProfile, TuningUpdate};
use crate::types::message::{ChatMessage, Role};
use serde::{Deserialize, Serialize};

/// Per-request overrides; omitted fields fall back to the server profile
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingOverrides {
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub do_sample: Option<bool>,
}

impl SamplingOverrides {
    /// Overlay the request's fields onto `base`, rejecting out-of-range values
    pub fn resolve(&self, base: &TuningProfile) -> Result<TuningProfile, String> {
        let update = TuningUpdate {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_tokens: self.max_tokens,
            repetition_penalty: self.repetition_penalty,
            do_sample: self.do_sample,
        };
        update.check()?;
        Ok(update.apply_to(base))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(flatten)]
    pub sampling: SamplingOverrides,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub sampling: SamplingOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Whitespace word count, never below one. Used for metering only.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.split_whitespace().count() as u32).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

impl CompletionResponse {
    pub fn new(model: String, text: String, usage: Usage) -> Self {
        Self {
            id: format!("cmpl-{}", short_id()),
            object: "text_completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![CompletionChoice {
                index: 0,
                text,
                finish_reason: "stop".to_string(),
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn new(model: String, text: String, usage: Usage) -> Self {
        Self {
            id: format!("chatcmpl-{}", short_id()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::new(Role::Assistant, text),
                finish_reason: "stop".to_string(),
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn single(id: Option<String>) -> Self {
        Self {
            object: "list".to_string(),
            data: vec![ModelEntry {
                id: id.unwrap_or_else(|| "none".to_string()),
                object: "model".to_string(),
                owned_by: "local".to_string(),
            }],
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_fall_back_to_profile() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"prompt":"hi","max_tokens":7,"do_sample":false}"#).unwrap();
        let base = TuningProfile::default();
        let params = req.sampling.resolve(&base).unwrap();

        assert_eq!(params.max_tokens, 7);
        assert!(!params.do_sample);
        assert_eq!(params.temperature, base.temperature);
        assert_eq!(params.top_k, base.top_k);
    }

    #[test]
    fn test_out_of_range_overrides_are_rejected() {
        let base = TuningProfile::default();
        for body in [
            r#"{"temperature":-5}"#,
            r#"{"top_p":7}"#,
            r#"{"top_k":0}"#,
            r#"{"top_k":4294967295}"#,
            r#"{"max_tokens":0}"#,
            r#"{"max_tokens":1000000}"#,
            r#"{"repetition_penalty":0}"#,
        ] {
            let sampling: SamplingOverrides = serde_json::from_str(body).unwrap();
            assert!(sampling.resolve(&base).is_err(), "{} was accepted", body);
        }
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("  one   two\nthree "), 3);

        let usage = Usage::estimate("a b", "c d e");
        assert_eq!(usage.total_tokens, 5);
    }

    #[test]
    fn test_chat_response_shape() {
        let resp = ChatCompletionResponse::new("m".into(), "hello".into(), Usage::estimate("x", "hello"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert!(value["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(value["usage"]["total_tokens"], 2);
    }
}
