//! Codebox - run untrusted Python snippets in per-session or single-shot
//! interpreter environments and collect what they produce.

pub mod config;
pub mod error;
pub mod http_server;
pub mod sandbox;
pub mod state;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use sandbox::{MountedFile, RunRequest, RunResult, Sandbox};
pub use state::AppState;
