//! File-backed memory for the model's `memory` tool.
//!
//! Each owner gets one directory under the configured root. The model
//! addresses files with paths like `/memories/notes.md`; every path is
//! resolved lexically inside the owner's directory and rejected if it
//! would leave it, before or after symlinks are followed.
//!
//! Every outcome, including failures, is reported back to the model as text.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use ciq_core::tool::ClientTool;
use serde_json::Value;
use tracing::{debug, warn};

pub const MEMORY_TOOL_NAME: &str = "memory";

const DEFAULT_MAX_FILES: usize = 100;
const DEFAULT_MAX_FILE_CHARS: usize = 10_000;

#[derive(Debug, thiserror::Error)]
enum MemoryError {
    #[error("invalid username")]
    InvalidOwner,

    #[error("path traversal detected")]
    PathTraversal,

    #[error("memory limit reached ({0} files max)")]
    TooManyFiles(usize),

    #[error("file too large ({}KB max)", .0 / 1000)]
    FileTooLarge(usize),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Per-owner memory directories on the local filesystem.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    root: PathBuf,
    max_files: usize,
    max_file_chars: usize,
}

impl MemoryDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_files: DEFAULT_MAX_FILES,
            max_file_chars: DEFAULT_MAX_FILE_CHARS,
        }
    }

    pub fn with_limits(mut self, max_files: usize, max_file_chars: usize) -> Self {
        self.max_files = max_files;
        self.max_file_chars = max_file_chars;
        self
    }

    fn owner_dir(&self, owner: &str) -> Result<PathBuf, MemoryError> {
        let valid = !owner.is_empty()
            && owner
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(MemoryError::InvalidOwner);
        }
        Ok(self.root.join(owner))
    }

    /// Run one tool command for `owner`.
    async fn run(&self, owner: &str, input: &Value) -> Result<String, MemoryError> {
        let dir = self.owner_dir(owner)?;
        let command = input["command"].as_str().unwrap_or("");
        let path = input["path"].as_str().unwrap_or("");
        debug!(owner, command, path, "Memory tool call");

        match command {
            "view" => {
                let target = resolve(&dir, path).await?;
                let meta = match tokio::fs::metadata(&target).await {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Ok(if target == dir {
                            "No memories stored yet.".into()
                        } else {
                            format!("File not found: {path}")
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                if meta.is_dir() {
                    let files = list_files(&target).await?;
                    return Ok(if files.is_empty() {
                        "Directory is empty.".into()
                    } else {
                        files.join("\n")
                    });
                }
                let content = tokio::fs::read_to_string(&target).await?;
                Ok(content.chars().take(self.max_file_chars).collect())
            }
            "create" => {
                tokio::fs::create_dir_all(&dir).await?;
                let target = resolve(&dir, path).await?;
                if count_entries(&dir).await? >= self.max_files {
                    return Err(MemoryError::TooManyFiles(self.max_files));
                }
                let text = input["file_text"].as_str().unwrap_or("");
                if text.chars().count() > self.max_file_chars {
                    return Err(MemoryError::FileTooLarge(self.max_file_chars));
                }
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, text).await?;
                Ok(format!("Created {path}"))
            }
            "str_replace" => {
                let target = resolve(&dir, path).await?;
                if !exists(&target).await? {
                    return Ok(format!("File not found: {path}"));
                }
                let old = input["old_str"].as_str().unwrap_or("");
                let new = input["new_str"].as_str().unwrap_or("");
                let text = tokio::fs::read_to_string(&target).await?;
                if !text.contains(old) {
                    return Ok(format!("String not found in {path}"));
                }
                tokio::fs::write(&target, text.replacen(old, new, 1)).await?;
                Ok(format!("Updated {path}"))
            }
            "delete" => {
                let target = resolve(&dir, path).await?;
                match tokio::fs::metadata(&target).await {
                    Ok(meta) if meta.is_file() => {
                        tokio::fs::remove_file(&target).await?;
                        Ok(format!("Deleted {path}"))
                    }
                    Ok(_) => Ok("Cannot delete directories".into()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(format!("File not found: {path}")),
                    Err(e) => Err(e.into()),
                }
            }
            other => Ok(format!("Unknown command: {other}")),
        }
    }
}

#[async_trait]
impl ClientTool for MemoryDirectory {
    fn name(&self) -> &str {
        MEMORY_TOOL_NAME
    }

    async fn execute(&self, owner: &str, input: &Value) -> String {
        match self.run(owner, input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(owner, error = %e, "Memory tool error");
                format!("Error: {e}")
            }
        }
    }
}

/// Resolve a model-supplied path inside `dir`.
///
/// A leading `/memories/` is dropped. Only plain name components are
/// accepted, and the target must still be inside `dir` once symlinks are
/// followed.
async fn resolve(dir: &Path, path: &str) -> Result<PathBuf, MemoryError> {
    let relative = path.strip_prefix('/').unwrap_or(path);
    let relative = relative.strip_prefix("memories").unwrap_or(relative);
    let relative = relative.strip_prefix('/').unwrap_or(relative);

    let mut target = dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => return Err(MemoryError::PathTraversal),
        }
    }

    // The deepest existing ancestor decides where a write would land.
    let Ok(root) = tokio::fs::canonicalize(dir).await else {
        return Ok(target);
    };
    for ancestor in target.ancestors() {
        if let Ok(real) = tokio::fs::canonicalize(ancestor).await {
            if !real.starts_with(&root) {
                return Err(MemoryError::PathTraversal);
            }
            break;
        }
    }
    Ok(target)
}

async fn exists(path: &Path) -> Result<bool, MemoryError> {
    Ok(tokio::fs::try_exists(path).await?)
}

/// Names of the plain files directly inside `dir`, sorted.
async fn list_files(dir: &Path) -> Result<Vec<String>, MemoryError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

async fn count_entries(dir: &Path) -> Result<usize, MemoryError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}
