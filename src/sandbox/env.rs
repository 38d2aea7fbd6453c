//! Interpreter environments: creation and package installation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};

/// Specifiers already installed into an environment, one per line.
const INSTALLED_MARKER: &str = ".installed";

/// Prepares the interpreter a script runs under.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Ensure an environment rooted at `env_dir` has `packages` installed and
    /// return the interpreter to run scripts with.
    async fn provision(&self, env_dir: &Path, packages: &[String]) -> Result<PathBuf>;
}

/// Requested packages first, then the baseline, keeping the first occurrence
/// of each specifier.
pub fn install_set(requested: &[String], baseline: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .chain(baseline)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

/// Python virtual environments built with `venv` and populated with `pip`.
///
/// The environment is created only if its interpreter is missing, and only
/// specifiers not already recorded in the environment are installed, so a
/// session pays for each package once.
#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    python: PathBuf,
}

impl VenvProvisioner {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

#[async_trait]
impl Provisioner for VenvProvisioner {
    async fn provision(&self, env_dir: &Path, packages: &[String]) -> Result<PathBuf> {
        let interpreter = venv_interpreter(env_dir);

        if !fs::try_exists(&interpreter).await? {
            info!(env_dir = ?env_dir, python = ?self.python, "Creating virtual environment");
            let mut cmd = Command::new(&self.python);
            cmd.arg("-m").arg("venv").arg(env_dir);
            run_installer(cmd).await?;
        }

        let installed = read_installed(env_dir).await?;
        let pending: Vec<String> = packages
            .iter()
            .filter(|p| !installed.contains(p.as_str()))
            .cloned()
            .collect();

        if !pending.is_empty() {
            info!(packages = ?pending, "Installing packages");
            let mut cmd = Command::new(&interpreter);
            cmd.args(["-m", "pip", "install", "--no-cache-dir"]).args(&pending);
            run_installer(cmd).await?;
            record_installed(env_dir, &pending).await?;
        }

        Ok(interpreter)
    }
}

/// Runs scripts with an existing interpreter, skipping environment creation.
/// Packages cannot be installed in this mode.
#[derive(Debug, Clone)]
pub struct SystemInterpreter {
    interpreter: PathBuf,
}

impl SystemInterpreter {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

#[async_trait]
impl Provisioner for SystemInterpreter {
    async fn provision(&self, env_dir: &Path, packages: &[String]) -> Result<PathBuf> {
        if !packages.is_empty() {
            warn!(packages = ?packages, "Package installation disabled, using system interpreter as-is");
        }
        fs::create_dir_all(env_dir).await?;
        Ok(self.interpreter.clone())
    }
}

/// Interpreter entry point inside a venv.
pub fn venv_interpreter(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

async fn run_installer(mut cmd: Command) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SandboxError::EnvironmentBuild {
            stderr: format!("failed to start installer: {e}"),
        })?;

    if !output.status.success() {
        return Err(SandboxError::EnvironmentBuild {
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

async fn read_installed(env_dir: &Path) -> Result<HashSet<String>> {
    match fs::read_to_string(env_dir.join(INSTALLED_MARKER)).await {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e.into()),
    }
}

async fn record_installed(env_dir: &Path, packages: &[String]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(env_dir.join(INSTALLED_MARKER))
        .await?;
    for package in packages {
        file.write_all(package.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    Ok(())
}
