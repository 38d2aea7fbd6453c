//! Read-only views into a session's working directory.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::artifacts::guess_mime;
use super::workspace::{safe_relative, to_slash, ENV_DIR, OUTPUT_DIR};
use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Relative to the session root, forward slashes.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePreview {
    pub path: String,
    pub size: u64,
    pub mime: String,
    pub content: String,
    pub encoding: Encoding,
    pub truncated: bool,
}

/// Entries directly inside `dir_path` (the session root when `None`).
/// Symlinks are skipped; the interpreter environment is hidden.
pub async fn list_dir(root: &Path, dir_path: Option<&str>) -> Result<Vec<DirEntry>> {
    let relative = match dir_path.map(str::trim).filter(|p| !p.is_empty() && *p != ".") {
        Some(p) => safe_relative(p)?,
        None => PathBuf::new(),
    };
    let dir = resolve_inside(root, &relative).await?;
    if !fs::metadata(&dir).await?.is_dir() {
        return Err(SandboxError::validation(format!(
            "not a directory: {}",
            to_slash(&relative)
        )));
    }

    let mut entries = Vec::new();
    let mut reader = fs::read_dir(&dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        if relative.as_os_str().is_empty() && entry.file_name() == ENV_DIR {
            continue;
        }
        let file_type = entry.file_type().await?;
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };
        let size = match kind {
            EntryKind::File => entry.metadata().await?.len(),
            EntryKind::Directory => 0,
        };
        entries.push(DirEntry {
            path: to_slash(&relative.join(entry.file_name())),
            kind,
            size,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Up to `max_bytes` of a file, as text when it decodes as UTF-8 and base64
/// otherwise.
pub async fn preview_file(root: &Path, relative_path: &str, max_bytes: usize) -> Result<FilePreview> {
    let relative = safe_relative(relative_path)?;
    let path = resolve_file(root, &relative).await?;
    let size = fs::metadata(&path).await?.len();

    let mut buf = Vec::with_capacity(max_bytes.min(size as usize));
    fs::File::open(&path)
        .await?
        .take(max_bytes as u64)
        .read_to_end(&mut buf)
        .await?;
    let truncated = (buf.len() as u64) < size;

    let (content, encoding) = match std::str::from_utf8(&buf) {
        Ok(text) => (text.to_string(), Encoding::Utf8),
        // The cut may land inside a multi-byte character.
        Err(e) if truncated && e.error_len().is_none() => (
            String::from_utf8_lossy(&buf[..e.valid_up_to()]).into_owned(),
            Encoding::Utf8,
        ),
        Err(_) => (BASE64.encode(&buf), Encoding::Base64),
    };

    Ok(FilePreview {
        path: to_slash(&relative),
        size,
        mime: guess_mime(&path),
        content,
        encoding,
        truncated,
    })
}

/// Raw bytes and content type of a file under `output/`.
///
/// Only what the artifact collector would report is served: symlinks are
/// refused, and so is anything whose real path is outside `output/`.
pub async fn read_artifact(root: &Path, relative_path: &str) -> Result<(Vec<u8>, String)> {
    let relative = Path::new(OUTPUT_DIR).join(safe_relative(relative_path)?);
    let not_found = || SandboxError::NotFound(to_slash(&relative));

    let meta = fs::symlink_metadata(root.join(&relative))
        .await
        .map_err(|_| not_found())?;
    if !meta.is_file() {
        return Err(not_found());
    }
    let output = resolve_inside(root, Path::new(OUTPUT_DIR)).await?;
    let path = resolve_file(root, &relative).await?;
    if !path.starts_with(&output) {
        return Err(not_found());
    }
    let bytes = fs::read(&path).await?;
    Ok((bytes, guess_mime(&path)))
}

async fn resolve_file(root: &Path, relative: &Path) -> Result<PathBuf> {
    let path = resolve_inside(root, relative).await?;
    if !fs::metadata(&path).await?.is_file() {
        return Err(SandboxError::NotFound(to_slash(relative)));
    }
    Ok(path)
}

/// Canonicalize `root/relative` and make sure symlinks did not lead outside `root`.
async fn resolve_inside(root: &Path, relative: &Path) -> Result<PathBuf> {
    let not_found = || SandboxError::NotFound(to_slash(relative));
    let root = fs::canonicalize(root).await.map_err(|_| not_found())?;
    let path = fs::canonicalize(root.join(relative))
        .await
        .map_err(|_| not_found())?;
    if !path.starts_with(&root) {
        return Err(not_found());
    }
    Ok(path)
}
