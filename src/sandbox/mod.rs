//! Core sandbox execution: turns a run request into an isolated, time-bounded
//! interpreter run and a structured result.

pub mod artifacts;
pub mod env;
pub mod fetch;
pub mod inspect;
pub mod process;
pub mod workspace;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{SandboxConfig, MAX_CODE_CHARS};
use crate::error::{Result, SandboxError};
use crate::state::{SessionInfo, SessionRegistry};
use artifacts::{collect_artifacts, Artifact};
use env::{install_set, Provisioner, VenvProvisioner};
use fetch::{download_files, Mount};
use inspect::{DirEntry, FilePreview};
use process::{run_script, ProcessOutput};
use workspace::{remove_tree, safe_relative, session_dir, validate_id, Workspace, ENV_DIR};

/// Attached to results whose stdout is empty.
pub const EMPTY_STDOUT_FEEDBACK: &str = "The code produced no stdout. Only printed output is \
    captured: use print() on any value you want returned.";

/// A remote file to place under `mounts/` before the script runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountedFile {
    pub url: String,
    #[serde(rename = "mountPath", alias = "mount_path", default)]
    pub mount_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub code: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub files: Vec<MountedFile>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Steps of a single call, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvingDir,
    FetchingFiles,
    BuildingEnv,
    Executing,
    CollectingArtifacts,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ResolvingDir => "resolving-dir",
            Stage::FetchingFiles => "fetching-files",
            Stage::BuildingEnv => "building-env",
            Stage::Executing => "executing",
            Stage::CollectingArtifacts => "collecting-artifacts",
        })
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    client: reqwest::Client,
    provisioner: Arc<dyn Provisioner>,
    sessions: SessionRegistry,
}

impl Sandbox {
    /// Sandbox that builds a virtual environment per session or run.
    pub fn new(config: SandboxConfig) -> Self {
        let provisioner = Arc::new(VenvProvisioner::new(config.python.clone()));
        Self::with_provisioner(config, provisioner)
    }

    pub fn with_provisioner(config: SandboxConfig, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            provisioner,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Run `request.code` and report its output and artifacts.
    ///
    /// With a `session_id` the working directory and environment persist and
    /// calls against the same session run one at a time. Without one, the
    /// call gets a fresh `run_<run_id>` directory that is deleted before
    /// returning, whether or not the run succeeded.
    pub async fn execute(&self, request: RunRequest, run_id: &str) -> Result<RunResult> {
        let mounts = validate(&request, run_id)?;
        let span = info_span!(
            "execute",
            run_id,
            session_id = request.session_id.as_deref().unwrap_or("-")
        );
        self.execute_validated(request, mounts, run_id)
            .instrument(span)
            .await
    }

    async fn execute_validated(
        &self,
        request: RunRequest,
        mounts: Vec<Mount>,
        run_id: &str,
    ) -> Result<RunResult> {
        debug!(stage = %Stage::ResolvingDir);
        let _session_guard = match &request.session_id {
            Some(id) => {
                let root = session_dir(&self.config.tmp_dir, id)?;
                Some(self.sessions.acquire(id, root).await)
            }
            None => None,
        };
        let workspace =
            Workspace::resolve(&self.config.tmp_dir, request.session_id.as_deref(), run_id).await?;

        let outcome = self.run_in(&workspace, &request, &mounts).await;
        if let Err(e) = workspace.destroy().await {
            warn!(error = %e, "Failed to remove run directory");
        }
        if let Some(id) = &request.session_id {
            self.sessions.touch(id).await;
        }

        let (output, artifacts) = match outcome {
            Ok(done) => done,
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Run failed");
                return Err(e);
            }
        };

        info!(
            exit_code = ?output.status.code(),
            artifacts = artifacts.len(),
            "Run done"
        );
        let feedback = output
            .stdout
            .is_empty()
            .then(|| EMPTY_STDOUT_FEEDBACK.to_string());
        Ok(RunResult {
            stdout: output.stdout,
            stderr: output.stderr,
            artifacts,
            session_id: request.session_id,
            feedback,
        })
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        request: &RunRequest,
        mounts: &[Mount],
    ) -> Result<(ProcessOutput, Vec<Artifact>)> {
        debug!(stage = %Stage::FetchingFiles, files = mounts.len());
        download_files(&self.client, mounts, &workspace.mounts()).await?;

        debug!(stage = %Stage::BuildingEnv);
        let packages = install_set(&request.requirements, &self.config.baseline_packages);
        let interpreter = self
            .provisioner
            .provision(&workspace.root().join(ENV_DIR), &packages)
            .await?;

        debug!(stage = %Stage::Executing);
        let script = workspace.script();
        fs::write(&script, &request.code).await?;
        let output = run_script(&interpreter, &script, workspace.root(), self.config.timeout).await?;

        debug!(stage = %Stage::CollectingArtifacts);
        let output_dir = workspace.output();
        let artifacts = tokio::task::spawn_blocking(move || collect_artifacts(&output_dir)).await??;

        Ok((output, artifacts))
    }

    /// Register `session_*` directories left on disk by a previous process so
    /// they are visible and subject to expiry.
    pub async fn adopt_existing_sessions(&self) -> Result<usize> {
        fs::create_dir_all(&self.config.tmp_dir).await?;
        let mut adopted = 0;
        let mut reader = fs::read_dir(&self.config.tmp_dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(workspace::session_id_from_dir_name) else {
                continue;
            };
            self.sessions.register(id, entry.path()).await;
            adopted += 1;
        }
        if adopted > 0 {
            info!(adopted, "Adopted existing session directories");
        }
        Ok(adopted)
    }

    /// Delete sessions idle for longer than the configured TTL.
    pub async fn reap_expired_sessions(&self) -> usize {
        let expired = self.sessions.take_expired(self.config.session_ttl).await;
        let count = expired.len();
        for (id, root, _guard) in expired {
            info!(session_id = %id, "Cleaning up expired session");
            if let Err(e) = remove_tree(&root).await {
                warn!(session_id = %id, error = %e, "Failed to remove session directory");
            }
        }
        count
    }

    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        validate_id(session_id, "session_id")?;
        let (root, _guard) = self
            .sessions
            .remove(session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;
        remove_tree(&root).await?;
        info!(session_id, "Deleted session");
        Ok(())
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))
    }

    pub async fn list_dir(&self, session_id: &str, dir_path: Option<&str>) -> Result<Vec<DirEntry>> {
        let root = self.session_root(session_id).await?;
        inspect::list_dir(&root, dir_path).await
    }

    pub async fn preview_file(&self, session_id: &str, relative_path: &str) -> Result<FilePreview> {
        let root = self.session_root(session_id).await?;
        inspect::preview_file(&root, relative_path, self.config.max_output_bytes).await
    }

    pub async fn read_artifact(&self, session_id: &str, relative_path: &str) -> Result<(Vec<u8>, String)> {
        let root = self.session_root(session_id).await?;
        inspect::read_artifact(&root, relative_path).await
    }

    async fn session_root(&self, session_id: &str) -> Result<PathBuf> {
        validate_id(session_id, "session_id")?;
        self.sessions
            .root(session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))
    }
}

/// Check a request before anything touches the disk or network.
fn validate(request: &RunRequest, run_id: &str) -> Result<Vec<Mount>> {
    if request.code.trim().is_empty() {
        return Err(SandboxError::validation("code must not be empty"));
    }
    let chars = request.code.chars().count();
    if chars > MAX_CODE_CHARS {
        return Err(SandboxError::validation(format!(
            "code block too large ({chars} characters, limit {MAX_CODE_CHARS})"
        )));
    }

    match &request.session_id {
        Some(id) => validate_id(id, "session_id")?,
        None => validate_id(run_id, "run_id")?,
    }

    request
        .files
        .iter()
        .enumerate()
        .map(|(i, file)| {
            if file.url.trim().is_empty() {
                return Err(SandboxError::validation(format!("files[{i}].url is required")));
            }
            let mount_path = file
                .mount_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| {
                    SandboxError::validation(format!("files[{i}].mountPath is required"))
                })?;
            Ok(Mount {
                url: file.url.clone(),
                relative: safe_relative(mount_path)?,
            })
        })
        .collect()
}
