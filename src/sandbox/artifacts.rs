//! Artifact metadata for files a script leaves under `output/`.

use std::path::Path;

use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::workspace::to_slash;
use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    /// Path relative to `output/`, always with forward slashes.
    pub relative_path: String,
    pub size: u64,
    pub mime: String,
}

/// Best-effort content type from a file name.
pub fn guess_mime(path: &Path) -> String {
    MimeGuess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Enumerate every regular file below `output_dir`, sorted by relative path.
///
/// Symlinks are neither followed nor reported. A missing directory yields no
/// artifacts.
pub fn collect_artifacts(output_dir: &Path) -> Result<Vec<Artifact>> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut artifacts = Vec::new();
    for entry in WalkDir::new(output_dir).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Unexpected(format!("walk output: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(output_dir)
            .map_err(|e| SandboxError::Unexpected(e.to_string()))?;
        let size = entry
            .metadata()
            .map_err(|e| SandboxError::Unexpected(format!("stat artifact: {e}")))?
            .len();

        artifacts.push(Artifact {
            name: entry.file_name().to_string_lossy().into_owned(),
            relative_path: to_slash(relative),
            size,
            mime: guess_mime(entry.path()),
        });
    }
    artifacts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(artifacts)
}
