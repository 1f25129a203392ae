//! The sandbox runtime seam.
//!
//! [`SandboxRuntime`] is the narrow interface the rest of the system uses
//! to drive containers. The production implementation talks to the Docker
//! engine; tests substitute scripted fakes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stats::RawSandboxStats;

/// Identity of a created sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHandle {
    pub id: String,
    pub name: String,
}

/// Everything the runtime needs to create one sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub name: String,
    pub image: String,
    /// Boot environment, ordered for reproducible container specs.
    pub env: BTreeMap<String, String>,
    pub adb_port: u16,
    pub vnc_port: u16,
    pub memory_bytes: u64,
    pub cpu_quota: i64,
    /// When set the sandbox gets no engine-managed network; a private
    /// namespace is attached separately.
    pub isolated: bool,
    /// Host directory mounted at `/data` inside the sandbox.
    pub data_dir: PathBuf,
}

/// Engine-reported lifecycle state of a sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    /// The engine has no container under this name.
    Missing,
}

impl SandboxState {
    /// Maps an engine status string onto the closed state set.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "removing" => Self::Exited,
            _ => Self::Dead,
        }
    }

    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    #[must_use]
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Result of running a command inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Interleaved stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container-engine operations the instance lifecycle is built from.
///
/// `create` only materializes the container; callers start it separately
/// once networking is attached.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Verifies the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Creates a stopped sandbox container, pulling the image if needed.
    async fn create(&self, config: &SandboxConfig) -> Result<RuntimeHandle>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Stops the sandbox, giving it `timeout_secs` to exit cleanly.
    async fn stop(&self, name: &str, timeout_secs: u32) -> Result<()>;

    /// Force-removes the sandbox. Absent containers are not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    async fn state(&self, name: &str) -> Result<SandboxState>;

    /// Runs `command` inside the sandbox and collects its output.
    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput>;

    /// One raw usage sample from the engine.
    async fn raw_stats(&self, name: &str) -> Result<RawSandboxStats>;

    /// The last `tail` lines of sandbox output.
    async fn logs(&self, name: &str, tail: usize) -> Result<String>;
}
