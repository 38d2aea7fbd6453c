//! On-disk layout of a session or single-shot run.
//!
//! ```text
//! <tmp_dir>/session_<id>/   or   <tmp_dir>/run_<run_id>/
//!     mounts/      downloaded read-only inputs
//!     output/      files collected as artifacts
//!     env/         interpreter environment
//!     script.py    submitted code, written verbatim
//! ```

use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};

pub const MOUNTS_DIR: &str = "mounts";
pub const OUTPUT_DIR: &str = "output";
pub const ENV_DIR: &str = "env";
pub const SCRIPT_FILE: &str = "script.py";

const SESSION_PREFIX: &str = "session_";
const RUN_PREFIX: &str = "run_";
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceKind {
    Session(String),
    SingleShot(String),
}

/// A resolved working directory. Single-shot workspaces are removed when
/// [`Workspace::destroy`] runs, or in the background if the owning call is
/// dropped before reaching it.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    kind: WorkspaceKind,
    destroyed: bool,
}

impl Workspace {
    /// Resolve and prepare the directory for a call.
    ///
    /// Session directories are reused as-is. A single-shot directory is always
    /// fresh: a stale one with the same name is deleted first.
    pub async fn resolve(tmp_dir: &Path, session_id: Option<&str>, run_id: &str) -> Result<Self> {
        let (root, kind) = match session_id {
            Some(id) => (session_dir(tmp_dir, id)?, WorkspaceKind::Session(id.to_string())),
            None => {
                validate_id(run_id, "run_id")?;
                (
                    tmp_dir.join(format!("{RUN_PREFIX}{run_id}")),
                    WorkspaceKind::SingleShot(run_id.to_string()),
                )
            }
        };

        if matches!(kind, WorkspaceKind::SingleShot(_)) && fs::try_exists(&root).await? {
            debug!(root = ?root, "Removing stale run directory");
            fs::remove_dir_all(&root).await?;
        }

        fs::create_dir_all(root.join(MOUNTS_DIR)).await?;
        fs::create_dir_all(root.join(OUTPUT_DIR)).await?;

        Ok(Self {
            root,
            kind,
            destroyed: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> &WorkspaceKind {
        &self.kind
    }

    pub fn is_session(&self) -> bool {
        matches!(self.kind, WorkspaceKind::Session(_))
    }

    pub fn mounts(&self) -> PathBuf {
        self.root.join(MOUNTS_DIR)
    }

    pub fn output(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn script(&self) -> PathBuf {
        self.root.join(SCRIPT_FILE)
    }

    /// Tear down a single-shot workspace. Session workspaces are left alone.
    pub async fn destroy(mut self) -> Result<()> {
        if self.is_session() {
            return Ok(());
        }
        self.destroyed = true;
        remove_tree(&self.root).await
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.destroyed || self.is_session() {
            return;
        }
        // The call was abandoned before cleanup; finish it off-thread.
        let root = self.root.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                if let Err(e) = std::fs::remove_dir_all(&root) {
                    warn!(root = ?root, error = %e, "Failed to remove abandoned run directory");
                }
            });
        }
    }
}

/// Directory of the session with the given id.
pub fn session_dir(tmp_dir: &Path, session_id: &str) -> Result<PathBuf> {
    validate_id(session_id, "session_id")?;
    Ok(tmp_dir.join(format!("{SESSION_PREFIX}{session_id}")))
}

/// Inverse of [`session_dir`]: the session id encoded in a directory name.
pub fn session_id_from_dir_name(name: &str) -> Option<&str> {
    let id = name.strip_prefix(SESSION_PREFIX)?;
    validate_id(id, "session_id").ok().map(|_| id)
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_tree(root: &Path) -> Result<()> {
    match fs::remove_dir_all(root).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Ids become directory names, so only a conservative character set is allowed.
pub fn validate_id(id: &str, what: &str) -> Result<()> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(SandboxError::validation(format!(
            "{what} must be 1-{MAX_ID_LEN} characters of [A-Za-z0-9_.-]"
        )))
    }
}

/// Normalize a caller-supplied relative path, rejecting anything that could
/// escape the directory it is joined onto.
pub fn safe_relative(raw: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::validation(format!(
                    "path must be relative and stay inside the workspace: {raw:?}"
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SandboxError::validation(format!("empty path: {raw:?}")));
    }
    Ok(clean)
}

/// Render a relative path with forward slashes regardless of host OS.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_workspace_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::resolve(tmp.path(), Some("abc"), "r1").await.unwrap();
        assert_eq!(ws.root(), tmp.path().join("session_abc"));
        assert!(ws.mounts().is_dir());
        assert!(ws.output().is_dir());
        std::fs::write(ws.output().join("keep.txt"), b"x").unwrap();
        ws.destroy().await.unwrap();

        let again = Workspace::resolve(tmp.path(), Some("abc"), "r2").await.unwrap();
        assert!(again.output().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn single_shot_replaces_stale_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("run_r1");
        std::fs::create_dir_all(stale.join("output")).unwrap();
        std::fs::write(stale.join("output/old.txt"), b"old").unwrap();

        let ws = Workspace::resolve(tmp.path(), None, "r1").await.unwrap();
        assert_eq!(ws.root(), stale);
        assert!(!ws.output().join("old.txt").exists());
        assert!(ws.mounts().is_dir());

        ws.destroy().await.unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn ids_are_path_safe() {
        assert!(validate_id("abc-123_x.y", "session_id").is_ok());
        assert!(validate_id("", "session_id").is_err());
        assert!(validate_id("..", "session_id").is_err());
        assert!(validate_id("a/b", "session_id").is_err());
        assert!(validate_id(&"a".repeat(129), "session_id").is_err());
    }

    #[test]
    fn safe_relative_rejects_escapes() {
        assert_eq!(safe_relative("./a/b.csv").unwrap(), PathBuf::from("a/b.csv"));
        assert!(safe_relative("../etc/passwd").is_err());
        assert!(safe_relative("/etc/passwd").is_err());
        assert!(safe_relative("a/../../b").is_err());
        assert!(safe_relative("").is_err());
    }

    #[test]
    fn session_dir_names_round_trip() {
        assert_eq!(session_id_from_dir_name("session_abc"), Some("abc"));
        assert_eq!(session_id_from_dir_name("run_abc"), None);
        assert_eq!(session_id_from_dir_name("session_"), None);
    }

    #[test]
    fn slash_rendering() {
        assert_eq!(to_slash(Path::new("plots/2024/a.png")), "plots/2024/a.png");
    }
}
