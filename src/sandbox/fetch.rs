//! Downloads remote files into a workspace's `mounts/` directory.

use std::path::{Path, PathBuf};

use futures_util::future::try_join_all;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};

/// A validated download: the source URL and where it lands under `mounts/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub url: String,
    pub relative: PathBuf,
}

/// Fetch every mount concurrently and write it below `dest`.
///
/// All bodies are fetched in parallel and joined before anything touches the
/// disk, then written in list order, so when two mounts share a path the later
/// entry wins. The first failing download aborts the batch; the remaining
/// in-flight requests are abandoned.
pub async fn download_files(
    client: &reqwest::Client,
    mounts: &[Mount],
    dest: &Path,
) -> Result<Vec<PathBuf>> {
    if mounts.is_empty() {
        return Ok(Vec::new());
    }

    info!(count = mounts.len(), "Downloading mounted files");
    let bodies = try_join_all(mounts.iter().map(|m| fetch(client, &m.url))).await?;

    let mut written = Vec::with_capacity(mounts.len());
    for (mount, body) in mounts.iter().zip(bodies) {
        let local = dest.join(&mount.relative);
        write_read_only(&local, &body).await?;
        debug!(url = %mount.url, path = ?local, bytes = body.len(), "Mounted file");
        written.push(local);
    }
    Ok(written)
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let download_error = |reason: String| SandboxError::Download {
        url: url.to_string(),
        reason,
    };

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_error(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(download_error(format!("HTTP status {status}")));
    }
    let body = resp.bytes().await.map_err(|e| download_error(e.to_string()))?;
    Ok(body.to_vec())
}

async fn write_read_only(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    // A previous mount at this path is read-only; unlink it instead of writing through.
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::write(path, body).await?;

    if let Err(e) = make_read_only(path).await {
        debug!(path = ?path, error = %e, "Could not mark mount read-only");
    }
    Ok(())
}

#[cfg(unix)]
async fn make_read_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o444)).await
}

#[cfg(not(unix))]
async fn make_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve_files() -> SocketAddr {
        async fn file(UrlPath(name): UrlPath<String>) -> std::result::Result<String, StatusCode> {
            match name.as_str() {
                "missing" => Err(StatusCode::NOT_FOUND),
                other => Ok(format!("contents of {other}")),
            }
        }
        let app = Router::new().route("/files/:name", get(file));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn mount(addr: SocketAddr, name: &str, path: &str) -> Mount {
        Mount {
            url: format!("http://{addr}/files/{name}"),
            relative: PathBuf::from(path),
        }
    }

    #[tokio::test]
    async fn empty_list_does_no_io() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("mounts");
        let written = download_files(&reqwest::Client::new(), &[], &dest).await.unwrap();
        assert!(written.is_empty());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn downloads_into_nested_paths_read_only() {
        let addr = serve_files().await;
        let tmp = tempfile::tempdir().unwrap();
        let mounts = vec![mount(addr, "a", "a.txt"), mount(addr, "b", "nested/dir/b.txt")];

        let written = download_files(&reqwest::Client::new(), &mounts, tmp.path())
            .await
            .unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "contents of a");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("nested/dir/b.txt")).unwrap(),
            "contents of b"
        );
        let perms = std::fs::metadata(tmp.path().join("a.txt")).unwrap().permissions();
        assert!(perms.readonly());
    }

    #[tokio::test]
    async fn later_mount_wins_on_collision() {
        let addr = serve_files().await;
        let tmp = tempfile::tempdir().unwrap();
        let mounts = vec![mount(addr, "first", "data.csv"), mount(addr, "second", "data.csv")];

        download_files(&reqwest::Client::new(), &mounts, tmp.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(tmp.path().join("data.csv")).unwrap(),
            "contents of second"
        );
    }

    #[tokio::test]
    async fn remount_over_read_only_file() {
        let addr = serve_files().await;
        let tmp = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();

        download_files(&client, &[mount(addr, "one", "x.txt")], tmp.path())
            .await
            .unwrap();
        download_files(&client, &[mount(addr, "two", "x.txt")], tmp.path())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(tmp.path().join("x.txt")).unwrap(), "contents of two");
    }

    #[tokio::test]
    async fn non_success_status_fails_batch() {
        let addr = serve_files().await;
        let tmp = tempfile::tempdir().unwrap();
        let mounts = vec![mount(addr, "ok", "ok.txt"), mount(addr, "missing", "missing.txt")];

        let err = download_files(&reqwest::Client::new(), &mounts, tmp.path())
            .await
            .unwrap_err();

        match err {
            SandboxError::Download { url, reason } => {
                assert!(url.ends_with("/files/missing"));
                assert!(reason.contains("404"));
            }
            other => panic!("expected download error, got {other:?}"),
        }
    }
}
