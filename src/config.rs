//! Runtime configuration for the sandbox.

use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock bound on a single execution, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 100;

/// Default cap on bytes returned by file previews.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Idle sessions older than this are reclaimed (1 hour).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

/// Upper bound on submitted code length, in characters.
pub const MAX_CODE_CHARS: usize = 20_000;

/// Packages installed into every environment.
pub const BASELINE_PACKAGES: &[&str] = &["pandas", "numpy", "requests"];

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Root under which `session_*` and `run_*` directories live.
    pub tmp_dir: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// Base interpreter used to create environments.
    pub python: PathBuf,
    pub baseline_packages: Vec<String>,
    pub session_ttl: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("/tmp/codebox"),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            python: PathBuf::from("python3"),
            baseline_packages: BASELINE_PACKAGES.iter().map(|p| p.to_string()).collect(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

impl SandboxConfig {
    /// Parse a comma separated package list, dropping blanks.
    pub fn parse_package_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.tmp_dir, PathBuf::from("/tmp/codebox"));
        assert_eq!(config.timeout, Duration::from_secs(100));
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert!(config.baseline_packages.iter().any(|p| p == "pandas"));
        assert!(config.baseline_packages.iter().any(|p| p == "requests"));
    }

    #[test]
    fn package_list_parsing() {
        assert_eq!(
            SandboxConfig::parse_package_list(" pandas, ,numpy==1.26 ,"),
            vec!["pandas".to_string(), "numpy==1.26".to_string()]
        );
        assert!(SandboxConfig::parse_package_list("").is_empty());
    }
}
