//! Local model cache
//!
//! Models live in the hub tool layout:
//! `<root>/hub/models--<owner>--<name>/snapshots/<revision>/<files>` with
//! `refs/main` naming the revision the last download wrote.

use crate::storage::format_size;
use crate::types::model::BackendKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Weight format guessed from file extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Gguf,
    Safetensors,
    Pytorch,
    Unknown,
}

impl ModelFormat {
    fn detect<'a>(names: impl Iterator<Item = &'a Path>) -> Self {
        let mut format = ModelFormat::Unknown;
        for name in names {
            match name.extension().and_then(|e| e.to_str()) {
                Some("gguf") => return ModelFormat::Gguf,
                Some("safetensors") => format = ModelFormat::Safetensors,
                Some("bin") if format == ModelFormat::Unknown => format = ModelFormat::Pytorch,
                _ => {}
            }
        }
        format
    }

    /// Backend that would be picked for this format
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            ModelFormat::Gguf => Some(BackendKind::LlamaCpp),
            ModelFormat::Safetensors | ModelFormat::Pytorch => Some(BackendKind::Transformers),
            ModelFormat::Unknown => None,
        }
    }
}

/// One cached repository
#[derive(Debug, Clone, Serialize)]
pub struct CachedModel {
    pub repo_id: String,
    pub size: u64,
    pub size_str: String,
    pub nb_files: usize,
    pub last_modified: Option<String>,
    pub format: ModelFormat,
    /// Revision hashes shortened to 10 characters
    pub revisions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `model_dir` override, else `$HF_HOME`, else `~/.cache/huggingface`
    pub fn default_root(model_dir: Option<&Path>) -> PathBuf {
        if let Some(dir) = model_dir {
            return dir.to_path_buf();
        }
        if let Ok(home) = std::env::var("HF_HOME") {
            if !home.trim().is_empty() {
                return PathBuf::from(home);
            }
        }
        directories::BaseDirs::new()
            .map(|d| d.home_dir().join(".cache").join("huggingface"))
            .unwrap_or_else(|| PathBuf::from(".cache/huggingface"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hub(&self) -> PathBuf {
        self.root.join("hub")
    }

    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.hub()
            .join(format!("models--{}", repo_id.trim().replace('/', "--")))
    }

    pub fn snapshot_dir(&self, repo_id: &str, revision: &str) -> PathBuf {
        self.repo_dir(repo_id).join("snapshots").join(revision)
    }

    /// Record the revision a download wrote as `refs/main`
    pub fn write_ref(&self, repo_id: &str, revision: &str) -> std::io::Result<()> {
        let refs = self.repo_dir(repo_id).join("refs");
        fs::create_dir_all(&refs)?;
        fs::write(refs.join("main"), revision)
    }

    /// Most recently modified snapshot of a cached repository
    pub fn resolve(&self, repo_id: &str) -> Option<PathBuf> {
        let snapshots = self.repo_dir(repo_id).join("snapshots");
        fs::read_dir(snapshots)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir() && !has_partial_files(&e.path()))
            .filter_map(|e| {
                let modified = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, e.path()))
            })
            .max_by_key(|(modified, _)| *modified)
            .map(|(_, path)| path)
    }

    /// All cached model repositories, sorted by repo id
    pub fn list_models(&self) -> Vec<CachedModel> {
        let entries = match fs::read_dir(self.hub()) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut models: Vec<CachedModel> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let dir_name = e.file_name().to_string_lossy().into_owned();
                let repo_id = dir_name.strip_prefix("models--")?.replace("--", "/");
                Some(self.describe(&repo_id, &e.path()))
            })
            .collect();

        models.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
        models
    }

    fn describe(&self, repo_id: &str, repo_dir: &Path) -> CachedModel {
        let snapshots = repo_dir.join("snapshots");
        let files = files_under(&snapshots);

        let size: u64 = files.iter().map(|(_, len, _)| *len).sum();
        let last_modified = files
            .iter()
            .filter_map(|(_, _, modified)| *modified)
            .max()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

        let mut revisions: Vec<String> = fs::read_dir(&snapshots)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().chars().take(10).collect())
                    .collect()
            })
            .unwrap_or_default();
        revisions.sort();

        CachedModel {
            repo_id: repo_id.to_string(),
            size,
            size_str: format_size(size),
            nb_files: files.len(),
            last_modified,
            format: ModelFormat::detect(files.iter().map(|(p, _, _)| p.as_path())),
            revisions,
        }
    }

    /// Remove a repository from the cache. Returns false if it was not cached.
    pub fn delete(&self, repo_id: &str) -> std::io::Result<bool> {
        let dir = self.repo_dir(repo_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        tracing::info!(repo_id, "Deleted cached model");
        Ok(true)
    }

    pub fn is_cached(&self, repo_id: &str) -> bool {
        self.resolve(repo_id).is_some()
    }

    /// Total bytes under the hub directory
    pub fn total_size(&self) -> u64 {
        files_under(&self.hub()).iter().map(|(_, len, _)| *len).sum()
    }
}

/// True while a download into `dir` has files left half-written
fn has_partial_files(dir: &Path) -> bool {
    let pattern = format!("{}/**/*.incomplete", glob::Pattern::escape(&dir.to_string_lossy()));
    match glob::glob(&pattern) {
        Ok(mut paths) => paths.any(|p| p.is_ok()),
        Err(_) => false,
    }
}

/// Regular files below `dir` with their size and modification time
fn files_under(dir: &Path) -> Vec<(PathBuf, u64, Option<SystemTime>)> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(_) => return Vec::new(),
    };

    paths
        .filter_map(|p| p.ok())
        .filter_map(|p| {
            let meta = fs::metadata(&p).ok()?;
            meta.is_file()
                .then(|| (p, meta.len(), meta.modified().ok()))
        })
        .collect()
}
