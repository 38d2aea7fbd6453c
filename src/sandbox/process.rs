//! Runs a script under an interpreter with a wall-clock bound.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};

/// Captured output of a script that ran to completion, whatever its exit code.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
    pub elapsed: Duration,
}

/// Run `interpreter script` in `workdir` and wait at most `timeout`.
///
/// A non-zero exit is returned as a normal [`ProcessOutput`]. Exceeding the
/// bound kills the whole process group, reaps the child, and returns
/// [`SandboxError::Timeout`] with no partial output.
pub async fn run_script(
    interpreter: &Path,
    script: &Path,
    workdir: &Path,
    timeout: Duration,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new(interpreter);
    cmd.arg(script)
        .current_dir(workdir)
        .env_clear()
        .envs(script_env(interpreter, workdir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let mut child = cmd.spawn()?;
    let mut group = ProcessGroup::new(child.id());
    debug!(pid = ?child.id(), interpreter = ?interpreter, "Script started");

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());
    let readers = [stdout.abort_handle(), stderr.abort_handle()];

    // A descendant that left the group can hold the pipes open after the
    // child exits, so the reads share the deadline with the wait.
    let completed = tokio::time::timeout(timeout, async {
        let status = child.wait().await?;
        group.kill();
        let stdout = stdout.await??;
        let stderr = stderr.await??;
        Ok::<_, SandboxError>((status, stdout, stderr))
    })
    .await;

    let (status, stdout, stderr) = match completed {
        Ok(done) => done?,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Script timed out, killing");
            group.kill();
            // kill() also waits, so the child is reaped before returning.
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Child already exited");
            }
            for reader in &readers {
                reader.abort();
            }
            return Err(SandboxError::Timeout(timeout));
        }
    };
    let elapsed = started.elapsed();
    info!(
        exit_code = ?status.code(),
        elapsed_ms = elapsed.as_millis() as u64,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "Script finished"
    );

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        status,
        elapsed,
    })
}

fn capture<R>(stream: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            stream.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    })
}

/// Environment handed to the script. Nothing is inherited from the server
/// process except `LANG`.
fn script_env(interpreter: &Path, workdir: &Path) -> Vec<(&'static str, String)> {
    let mut path = String::from("/usr/local/bin:/usr/bin:/bin");
    if let Some(bin) = interpreter.parent().filter(|p| !p.as_os_str().is_empty()) {
        path = format!("{}:{path}", bin.display());
    }
    vec![
        ("PATH", path),
        ("HOME", workdir.display().to_string()),
        (
            "LANG",
            std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_string()),
        ),
        ("PYTHONUNBUFFERED", "1".to_string()),
    ]
}

/// The process group led by the script. Signalled at most once: on timeout,
/// after the leader exits, or on drop if the call was cancelled mid-run.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.take() else { return };
        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => debug!(pgid, error = %e, "killpg failed"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn run_sh(code: &str, timeout: Duration) -> (tempfile::TempDir, Result<ProcessOutput>) {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("script.py");
        std::fs::write(&script, code).unwrap();
        let result = run_script(Path::new("/bin/sh"), &script, tmp.path(), timeout).await;
        (tmp, result)
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let (_tmp, result) = run_sh("echo out; echo err >&2", Duration::from_secs(10)).await;
        let output = result.unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(output.status.success());
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let (_tmp, result) = run_sh("echo boom >&2; exit 3", Duration::from_secs(10)).await;
        let output = result.unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr, "boom\n");
    }

    #[tokio::test]
    async fn runs_in_workdir_with_scrubbed_env() {
        let (tmp, result) = run_sh("pwd; echo \"secret=$CODEBOX_TEST_SECRET\"", Duration::from_secs(10)).await;
        let output = result.unwrap();
        let cwd = std::fs::canonicalize(tmp.path()).unwrap();
        assert!(output.stdout.starts_with(&cwd.display().to_string()));
        assert!(output.stdout.contains("secret=\n"));
    }

    #[tokio::test]
    async fn timeout_kills_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("survived");
        let script = tmp.path().join("script.py");
        // The background child would create the marker if it outlived the kill.
        std::fs::write(
            &script,
            format!("(sleep 2; touch {}) &\nsleep 30\n", marker.display()),
        )
        .unwrap();

        let started = Instant::now();
        let err = run_script(Path::new("/bin/sh"), &script, tmp.path(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(d) if d == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn detached_pipe_holder_cannot_outlast_timeout() {
        let Some(setsid) = ["/usr/bin/setsid", "/bin/setsid"]
            .into_iter()
            .find(|p| Path::new(p).exists())
        else {
            return;
        };
        // The detached sleep escapes the group kill but keeps stdout open.
        let code = format!("{setsid} sleep 5 &\necho hi\n");

        let started = Instant::now();
        let (_tmp, result) = run_sh(&code, Duration::from_millis(500)).await;

        assert!(matches!(result, Err(SandboxError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn group_is_signalled_once() {
        use std::os::unix::process::ExitStatusExt;

        let mut cmd = Command::new("sleep");
        cmd.arg("30").process_group(0).kill_on_drop(true);
        let mut child = cmd.spawn().unwrap();
        let mut group = ProcessGroup::new(child.id());

        group.kill();
        assert!(group.pgid.is_none());
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGKILL as i32));

        // Disarmed: a later kill or the drop sends nothing.
        group.kill();
        assert!(group.pgid.is_none());
    }

    #[test]
    fn env_prefixes_interpreter_bin() {
        let env = script_env(Path::new("/work/env/bin/python"), Path::new("/work"));
        let path = env.iter().find(|(k, _)| *k == "PATH").unwrap();
        assert!(path.1.starts_with("/work/env/bin:"));
        let home = env.iter().find(|(k, _)| *k == "HOME").unwrap();
        assert_eq!(home.1, "/work");
    }
}
