//! Codebox - Python code sandbox with HTTP API and persistent sessions.
//!
//! Usage:
//!   codebox serve [--port 9000]                       # Start HTTP server
//!   codebox run script.py [-r pandas] [--session ID]  # Run one script locally

use clap::{Parser, Subcommand};
use codebox::config::{
    SandboxConfig, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SESSION_TTL_SECS, DEFAULT_TIMEOUT_SECS,
};
use codebox::sandbox::env::SystemInterpreter;
use codebox::{http_server, AppState, RunRequest, Sandbox};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "codebox")]
#[command(about = "Python code sandbox with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding session and run workspaces
    #[arg(long, env = "CODEBOX_TMP_DIR", default_value = "/tmp/codebox", global = true)]
    tmp_dir: PathBuf,

    /// Execution timeout in seconds
    #[arg(long, env = "CODEBOX_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    timeout: u64,

    /// Maximum bytes returned by file previews
    #[arg(long = "max-output", env = "CODEBOX_MAX_OUTPUT", default_value_t = DEFAULT_MAX_OUTPUT_BYTES, global = true)]
    max_output: usize,

    /// Base interpreter used to create environments
    #[arg(long, env = "CODEBOX_PYTHON", default_value = "python3", global = true)]
    python: PathBuf,

    /// Comma separated packages installed into every environment
    #[arg(long, env = "CODEBOX_BASELINE", global = true)]
    baseline: Option<String>,

    /// Seconds an idle session is kept before it is deleted
    #[arg(long, env = "CODEBOX_SESSION_TTL", default_value_t = DEFAULT_SESSION_TTL_SECS, global = true)]
    session_ttl: u64,

    /// Run scripts with the base interpreter instead of per-run environments
    #[arg(long, global = true)]
    no_venv: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "9000")]
        port: u16,
    },
    /// Execute a script file once and print the result as JSON
    Run {
        /// Script to execute
        script: PathBuf,

        /// Package to install before running (repeatable)
        #[arg(short = 'r', long = "requirement")]
        requirements: Vec<String>,

        /// Run inside a persistent session
        #[arg(long)]
        session: Option<String>,
    },
}

impl Args {
    fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig {
            tmp_dir: self.tmp_dir.clone(),
            timeout: Duration::from_secs(self.timeout),
            max_output_bytes: self.max_output,
            python: self.python.clone(),
            session_ttl: Duration::from_secs(self.session_ttl),
            ..SandboxConfig::default()
        };
        if let Some(baseline) = &self.baseline {
            config.baseline_packages = SandboxConfig::parse_package_list(baseline);
        }
        config
    }

    fn sandbox(&self) -> Sandbox {
        let config = self.sandbox_config();
        if self.no_venv {
            let provisioner = Arc::new(SystemInterpreter::new(config.python.clone()));
            Sandbox::with_provisioner(config, provisioner)
        } else {
            Sandbox::new(config)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let sandbox = args.sandbox();

    match args.command {
        Commands::Serve { port } => {
            if let Err(e) = sandbox.adopt_existing_sessions().await {
                error!(error = %e, "Cannot prepare workspace directory");
                return ExitCode::FAILURE;
            }
            if let Err(e) = http_server::run_server(port, AppState::new(sandbox)).await {
                error!(error = %e, "Server stopped");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Run {
            script,
            requirements,
            session,
        } => {
            let code = match tokio::fs::read_to_string(&script).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {}", script.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let request = RunRequest {
                code,
                requirements,
                files: Vec::new(),
                session_id: session,
            };
            let run_id = uuid::Uuid::new_v4().to_string();
            match sandbox.execute(request, &run_id).await {
                Ok(result) => match serde_json::to_string_pretty(&result) {
                    Ok(json) => {
                        println!("{json}");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        ExitCode::FAILURE
                    }
                },
                Err(e) => {
                    eprintln!("Error ({}): {}", e.kind(), e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_build_config() {
        let args = Args::try_parse_from(["codebox", "serve"]).unwrap();
        let config = args.sandbox_config();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(matches!(args.command, Commands::Serve { .. }));
    }

    #[test]
    fn cli_overrides() {
        let args = Args::try_parse_from([
            "codebox",
            "run",
            "job.py",
            "-r",
            "scipy",
            "--timeout",
            "60",
            "--baseline",
            "pandas,requests",
        ])
        .unwrap();
        let config = args.sandbox_config();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.baseline_packages, vec!["pandas", "requests"]);
        match args.command {
            Commands::Run { requirements, .. } => assert_eq!(requirements, vec!["scipy"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        assert!(Args::try_parse_from(["codebox", "serve", "--timeout", "soon"]).is_err());
    }
}
