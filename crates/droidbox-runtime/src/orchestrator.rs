//! Lifecycle sequencing over a [`SandboxRuntime`].
//!
//! The orchestrator owns every wait and probe in the sandbox lifecycle:
//! readiness after start, Android boot completion, health probing, and the
//! stop-then-remove teardown. Callers get typed outcomes; no raw engine
//! state leaks upward.

use std::sync::Arc;
use std::time::Duration;

use droidbox_error::CommonError;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::retry::poll_until;
use crate::runtime::{ExecOutput, SandboxRuntime};
use crate::stats::SandboxStats;

/// Timing knobs for lifecycle waits.
#[derive(Debug, Clone)]
pub struct OrchestratorTiming {
    /// How long a started sandbox may take to report running.
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    /// How long Android may take to finish booting.
    pub boot_timeout: Duration,
    pub boot_interval: Duration,
    /// Ceiling on each individual boot probe.
    pub probe_timeout: Duration,
    pub health_timeout: Duration,
    pub exec_timeout: Duration,
    /// Seconds a sandbox gets to exit cleanly on stop.
    pub stop_grace: u32,
    /// Shorter grace used when the sandbox is about to be removed anyway.
    pub remove_stop_grace: u32,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(60),
            ready_interval: Duration::from_secs(2),
            boot_timeout: Duration::from_secs(120),
            boot_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(30),
            stop_grace: 30,
            remove_stop_grace: 10,
        }
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    /// The probe ran but reported a degraded sandbox.
    Warning { detail: String },
    /// The probe failed outright or could not run in time.
    Critical { detail: String },
    NotRunning,
}

impl HealthVerdict {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }
}

/// Drives one sandbox through start, boot, probing, and teardown.
pub struct SandboxOrchestrator {
    runtime: Arc<dyn SandboxRuntime>,
    timing: OrchestratorTiming,
}

impl SandboxOrchestrator {
    #[must_use]
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self::with_timing(runtime, OrchestratorTiming::default())
    }

    #[must_use]
    pub const fn with_timing(runtime: Arc<dyn SandboxRuntime>, timing: OrchestratorTiming) -> Self {
        Self { runtime, timing }
    }

    /// Starts the sandbox and waits until the engine reports it running.
    ///
    /// Already-running sandboxes are left alone.
    ///
    /// # Errors
    ///
    /// Returns a timeout when the sandbox never reaches running, or the
    /// engine error that prevented the start.
    pub async fn start_sandbox(&self, name: &str) -> Result<()> {
        if self.runtime.state(name).await?.is_running() {
            debug!(sandbox = name, "sandbox already running");
            return Ok(());
        }
        self.runtime.start(name).await?;

        let runtime = &self.runtime;
        poll_until(
            "sandbox ready",
            self.timing.ready_timeout,
            self.timing.ready_interval,
            move || async move {
                matches!(runtime.state(name).await, Ok(state) if state.is_running()).then_some(())
            },
        )
        .await?;
        Ok(())
    }

    /// Waits for the Android system inside the sandbox to finish booting.
    ///
    /// # Errors
    ///
    /// Returns a timeout when boot does not complete within the window.
    pub async fn wait_for_boot(&self, name: &str) -> Result<()> {
        let command = boot_probe_command();
        let command = &command;
        let runtime = &self.runtime;
        let probe_timeout = self.timing.probe_timeout;
        poll_until(
            "sandbox boot",
            self.timing.boot_timeout,
            self.timing.boot_interval,
            move || async move {
                match timeout(probe_timeout, runtime.exec(name, command)).await {
                    Ok(Ok(out)) if out.succeeded() && out.output.trim() == "1" => Some(()),
                    Ok(Ok(_)) | Ok(Err(_)) | Err(_) => None,
                }
            },
        )
        .await?;
        debug!(sandbox = name, "android boot completed");
        Ok(())
    }

    /// Stops the sandbox with the standard grace period.
    ///
    /// Already-stopped sandboxes are left alone.
    ///
    /// # Errors
    ///
    /// Returns the engine error that prevented the stop.
    pub async fn stop_sandbox(&self, name: &str) -> Result<()> {
        if !self.runtime.state(name).await?.is_running() {
            debug!(sandbox = name, "sandbox already stopped");
            return Ok(());
        }
        self.runtime.stop(name, self.timing.stop_grace).await
    }

    /// Restarts the sandbox: clean stop when running, then a start with the
    /// usual readiness wait.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::stop_sandbox`] and
    /// [`Self::start_sandbox`].
    pub async fn restart_sandbox(&self, name: &str) -> Result<()> {
        self.stop_sandbox(name).await?;
        self.start_sandbox(name).await
    }

    /// Removes the sandbox, stopping it first when it is still running.
    ///
    /// A failed pre-stop is logged and removal continues; force-remove
    /// handles the rest. Absent sandboxes are not an error.
    ///
    /// # Errors
    ///
    /// Returns the engine error that prevented the removal itself.
    pub async fn remove_sandbox(&self, name: &str) -> Result<()> {
        match self.runtime.state(name).await {
            Ok(state) if state.is_running() => {
                if let Err(err) = self.runtime.stop(name, self.timing.remove_stop_grace).await {
                    warn!(sandbox = name, error = %err, "stop before remove failed");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(sandbox = name, error = %err, "state probe before remove failed"),
        }
        self.runtime.remove(name).await
    }

    /// Probes sandbox health with a short exec round-trip.
    ///
    /// # Errors
    ///
    /// Returns the engine error that prevented the state lookup. Probe
    /// failures are verdicts, not errors.
    pub async fn check_health(&self, name: &str) -> Result<HealthVerdict> {
        match self.runtime.state(name).await {
            Ok(state) if state.is_running() => {}
            Ok(_) => return Ok(HealthVerdict::NotRunning),
            Err(err) => return Err(err),
        }

        let command = health_probe_command();
        match timeout(self.timing.health_timeout, self.runtime.exec(name, &command)).await {
            Ok(Ok(out)) if out.exit_code == 0 => Ok(HealthVerdict::Healthy),
            Ok(Ok(out)) if out.exit_code == 1 => Ok(HealthVerdict::Warning {
                detail: "probe exit code 1".to_string(),
            }),
            Ok(Ok(out)) => Ok(HealthVerdict::Critical {
                detail: format!("probe exit code {}", out.exit_code),
            }),
            Ok(Err(err)) => Ok(HealthVerdict::Critical {
                detail: format!("probe failed: {err}"),
            }),
            Err(_) => Ok(HealthVerdict::Critical {
                detail: format!(
                    "probe timed out after {}s",
                    self.timing.health_timeout.as_secs()
                ),
            }),
        }
    }

    /// One normalized usage snapshot. Stopped sandboxes produce the
    /// not-running snapshot instead of an error.
    ///
    /// # Errors
    ///
    /// Returns the engine error that prevented sampling a running sandbox.
    pub async fn stats(&self, name: &str) -> Result<SandboxStats> {
        if !self.runtime.state(name).await?.is_running() {
            return Ok(SandboxStats::not_running());
        }
        Ok(self.runtime.raw_stats(name).await?.normalize())
    }

    /// Runs a command inside a running sandbox, bounded by the exec window.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotRunning`] for stopped sandboxes and a
    /// timeout when the command outlives the window.
    pub async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        if !self.runtime.state(name).await?.is_running() {
            return Err(RuntimeError::not_running(name));
        }
        timeout(self.timing.exec_timeout, self.runtime.exec(name, command))
            .await
            .map_err(|_| {
                CommonError::timeout(format!(
                    "exec in {name} after {}s",
                    self.timing.exec_timeout.as_secs()
                ))
            })?
    }

    /// The last `tail` lines of sandbox output.
    ///
    /// # Errors
    ///
    /// Returns the engine error that prevented the log read.
    pub async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        self.runtime.logs(name, tail).await
    }
}

fn boot_probe_command() -> Vec<String> {
    vec!["getprop".to_string(), "sys.boot_completed".to_string()]
}

fn health_probe_command() -> Vec<String> {
    vec!["echo".to_string(), "health_check".to_string()]
}
