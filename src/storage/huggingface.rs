//! HuggingFace hub client
//!
//! Manifest, search, whoami and ranged file fetches against the hub HTTP API.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Hub returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Invalid token")]
    Unauthorized,

    #[error("Invalid file name in manifest: {0}")]
    InvalidFileName(String),

    #[error("{0}")]
    Other(String),
}

/// Parsed model reference: a repo id plus an optional single file
#[derive(Debug, Clone, PartialEq)]
pub struct HuggingFaceUrl {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

impl HuggingFaceUrl {
    /// Parse various HuggingFace reference formats
    pub fn parse(url: &str) -> Result<Self, String> {
        // Accepted:
        // 1. https://huggingface.co/owner/repo/blob/main/model.gguf
        // 2. https://huggingface.co/owner/repo/resolve/main/model.gguf
        // 3. https://huggingface.co/owner/repo
        // 4. owner/repo/model.gguf
        // 5. owner/repo

        let url = url.trim();
        let url = url.split('?').next().unwrap_or(url);
        let url = url.split('#').next().unwrap_or(url);

        if url.contains("huggingface.co") {
            let path = url
                .replace("https://huggingface.co/", "")
                .replace("http://huggingface.co/", "");

            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            if parts.len() < 2 {
                return Err("Invalid HuggingFace URL format".to_string());
            }
            let repo_id = format!("{}/{}", parts[0], parts[1]);

            if let Some(pos) = parts.iter().position(|&p| p == "blob" || p == "resolve") {
                if parts.len() > pos + 2 {
                    return Ok(Self {
                        repo_id,
                        filename: parts[pos + 2..].join("/"),
                        revision: parts[pos + 1].to_string(),
                    });
                }
            }

            return Ok(Self {
                repo_id,
                filename: String::new(),
                revision: "main".to_string(),
            });
        }

        let parts: Vec<&str> = url.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() >= 2 {
            return Ok(Self {
                repo_id: format!("{}/{}", parts[0], parts[1]),
                filename: parts[2..].join("/"),
                revision: "main".to_string(),
            });
        }

        Err(format!("Could not parse model id: {:?}", url))
    }
}

/// Reject manifest names that would escape the snapshot directory
pub fn safe_relative_path(name: &str) -> Result<PathBuf, HubError> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path.to_path_buf())
    } else {
        Err(HubError::InvalidFileName(name.to_string()))
    }
}

/// One file of a remote repository
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoManifest {
    pub repo_id: String,
    /// Commit the manifest was read at
    pub sha: String,
    pub files: Vec<RepoFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub pipeline_tag: Option<String>,
}

/// A file body being streamed from the hub
pub struct FetchResponse {
    /// True when the hub honoured the requested offset (206)
    pub resumed: bool,
    pub stream: BoxStream<'static, Result<Bytes, HubError>>,
}

/// Remote model hub
#[async_trait]
pub trait Hub: Send + Sync {
    async fn manifest(&self, repo_id: &str) -> Result<RepoManifest, HubError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, HubError>;

    /// Username owning `token`
    async fn whoami(&self, token: &str) -> Result<String, HubError>;

    /// Stream a file starting at `offset`
    async fn fetch(
        &self,
        repo_id: &str,
        revision: &str,
        filename: &str,
        offset: u64,
    ) -> Result<FetchResponse, HubError>;

    /// Token sent with subsequent requests
    fn set_token(&self, token: Option<String>);
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

/// HTTP implementation of [`Hub`]
pub struct HfHub {
    client: reqwest::Client,
    endpoint: String,
    token: RwLock<Option<String>>,
}

impl HfHub {
    pub fn new(token: Option<String>) -> Result<Self, HubError> {
        let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let client = reqwest::Client::builder()
            .user_agent(concat!("llmd/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match self.token.read().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: reqwest::Response, repo_id: &str) -> Result<reqwest::Response, HubError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status.as_u16() {
            401 | 404 => Err(HubError::NotFound(repo_id.to_string())),
            code => Err(HubError::Status {
                status: code,
                url: response.url().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Hub for HfHub {
    async fn manifest(&self, repo_id: &str) -> Result<RepoManifest, HubError> {
        let url = format!("{}/api/models/{}?blobs=true", self.endpoint, repo_id);
        let response = Self::check(self.get(&url).send().await?, repo_id)?;
        let info: ModelInfo = response.json().await?;

        Ok(RepoManifest {
            repo_id: repo_id.to_string(),
            sha: info.sha.unwrap_or_else(|| "main".to_string()),
            files: info
                .siblings
                .into_iter()
                .map(|s| RepoFile {
                    name: s.rfilename,
                    size: s.size.unwrap_or(0),
                })
                .collect(),
        })
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, HubError> {
        let url = format!("{}/api/models", self.endpoint);
        let limit = limit.to_string();
        let response = self
            .get(&url)
            .query(&[
                ("search", query),
                ("sort", "downloads"),
                ("direction", "-1"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;
        let response = Self::check(response, query)?;
        Ok(response.json().await?)
    }

    async fn whoami(&self, token: &str) -> Result<String, HubError> {
        let url = format!("{}/api/whoami-v2", self.endpoint);
        let response = self.client.get(&url).bearer_auth(token).send().await?;
        if response.status().as_u16() == 401 {
            return Err(HubError::Unauthorized);
        }
        let response = Self::check(response, "whoami")?;
        let me: WhoAmI = response.json().await?;
        Ok(me.name)
    }

    async fn fetch(
        &self,
        repo_id: &str,
        revision: &str,
        filename: &str,
        offset: u64,
    ) -> Result<FetchResponse, HubError> {
        let url = format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, repo_id, revision, filename
        );
        tracing::debug!(url = %url, offset, "Fetching file");

        let mut request = self.get(&url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let response = Self::check(request.send().await?, repo_id)?;
        let resumed = response.status() == reqwest::StatusCode::PARTIAL_CONTENT;

        Ok(FetchResponse {
            resumed,
            stream: response.bytes_stream().map_err(HubError::from).boxed(),
        })
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hf_url_full() {
        let url = "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/blob/main/llama-2-7b.Q4_K_M.gguf";
        let parsed = HuggingFaceUrl::parse(url).unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(parsed.filename, "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(parsed.revision, "main");
    }

    #[test]
    fn test_parse_repo_id() {
        let parsed = HuggingFaceUrl::parse("Qwen/Qwen2-0.5B-Instruct").unwrap();
        assert_eq!(parsed.repo_id, "Qwen/Qwen2-0.5B-Instruct");
        assert_eq!(parsed.filename, "");
        assert!(HuggingFaceUrl::parse("justaname").is_err());
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(safe_relative_path("model.safetensors").is_ok());
        assert!(safe_relative_path("onnx/model.onnx").is_ok());
        assert!(safe_relative_path("../escape").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("").is_err());
    }
}
