#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};
use codebox::sandbox::env::SystemInterpreter;
use codebox::{RunRequest, Sandbox, SandboxConfig};

/// Sandbox whose "interpreter" is `/bin/sh`, so scripts are shell code and no
/// environment is built.
pub fn shell_sandbox(tmp_dir: &Path, timeout: Duration) -> Sandbox {
    Sandbox::with_provisioner(config(tmp_dir, timeout), Arc::new(SystemInterpreter::new("/bin/sh")))
}

pub fn config(tmp_dir: &Path, timeout: Duration) -> SandboxConfig {
    SandboxConfig {
        tmp_dir: tmp_dir.to_path_buf(),
        timeout,
        baseline_packages: Vec::new(),
        ..SandboxConfig::default()
    }
}

pub fn request(code: &str) -> RunRequest {
    RunRequest {
        code: code.to_string(),
        ..Default::default()
    }
}

/// Names of the entries directly under `dir`, sorted.
pub fn dir_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Serves `GET /files/<name>` as `contents of <name>`; `missing` is a 404.
pub async fn file_server() -> SocketAddr {
    async fn file(UrlPath(name): UrlPath<String>) -> Result<String, StatusCode> {
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
