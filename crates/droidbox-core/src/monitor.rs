//! Periodic health sweeps over running instances.
//!
//! The monitor lists every running instance on a fixed interval, probes it
//! through the engine, and reacts per verdict: a healthy sandbox gets a
//! heartbeat, a degraded one a log line, and a dead or critically unhealthy
//! one is marked failed and, policy permitting, restarted in place with its
//! spec and identity preserved.

use std::time::Duration;

use tracing::{debug, info, warn};

use droidbox_runtime::HealthVerdict;

use crate::config::{MonitorConfig, RestartPolicy};
use crate::error::Result;
use crate::instance::{InstanceId, InstanceState, ListFilter};
use crate::manager::InstanceManager;

/// Outcome counters for one pass over the running instances.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances that were running when the sweep started.
    pub checked: usize,
    pub healthy: usize,
    pub warned: usize,
    pub restarted: usize,
    pub failed: usize,
}

/// Drives recurring health sweeps against an [`InstanceManager`].
pub struct HealthMonitor {
    manager: InstanceManager,
    interval: Duration,
    policy: RestartPolicy,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(manager: InstanceManager, config: &MonitorConfig) -> Self {
        Self {
            manager,
            interval: Duration::from_secs(config.interval_secs),
            policy: config.restart_policy,
        }
    }

    /// Runs sweeps forever, pausing `interval` between passes.
    ///
    /// A sweep that fails outright doubles the next pause instead of
    /// aborting the loop.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            policy = ?self.policy,
            "health monitor started"
        );
        let mut wait = self.interval;
        loop {
            match self.sweep().await {
                Ok(report) => {
                    if report.checked > 0 {
                        debug!(
                            checked = report.checked,
                            healthy = report.healthy,
                            warned = report.warned,
                            restarted = report.restarted,
                            failed = report.failed,
                            "health sweep complete"
                        );
                    }
                    wait = self.interval;
                }
                Err(e) => {
                    warn!(error = %e, "health sweep failed");
                    wait = self.interval * 2;
                }
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Probes every running instance once and reacts to the verdicts.
    ///
    /// Instances are handled independently; one bad sandbox never stops the
    /// rest of the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only when the instance registry cannot be read.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let running = self
            .manager
            .list_instances(&ListFilter::by_state(InstanceState::Running))?;
        let mut report = SweepReport {
            checked: running.len(),
            ..SweepReport::default()
        };

        for instance in running {
            match self.manager.check_health(&instance.id).await {
                Ok(HealthVerdict::Healthy) => {
                    self.manager.record_heartbeat(&instance.id);
                    report.healthy += 1;
                }
                Ok(HealthVerdict::Warning { detail }) => {
                    warn!(instance = %instance.id, detail = %detail, "sandbox degraded");
                    report.warned += 1;
                }
                Ok(HealthVerdict::Critical { detail }) => {
                    warn!(instance = %instance.id, detail = %detail, "sandbox critical");
                    self.manager
                        .mark_failed(&instance.id, &format!("health probe critical: {detail}"));
                    report.failed += 1;
                    // A sandbox that answers probes this badly will not
                    // recover on its own; restart under either policy.
                    self.restart(&instance.id, &mut report);
                }
                Ok(HealthVerdict::NotRunning) => {
                    warn!(instance = %instance.id, "sandbox exited underneath us");
                    self.manager.mark_failed(&instance.id, "sandbox not running");
                    report.failed += 1;
                    if self.policy == RestartPolicy::Always {
                        self.restart(&instance.id, &mut report);
                    }
                }
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "health check failed");
                    self.manager
                        .mark_failed(&instance.id, &format!("health check failed: {e}"));
                    report.failed += 1;
                    if self.policy == RestartPolicy::Always {
                        self.restart(&instance.id, &mut report);
                    }
                }
            }
        }

        Ok(report)
    }

    fn restart(&self, id: &InstanceId, report: &mut SweepReport) {
        match self.manager.restart_instance(id) {
            Ok(()) => report.restarted += 1,
            Err(e) => warn!(instance = %id, error = %e, "restart rejected"),
        }
    }
}
