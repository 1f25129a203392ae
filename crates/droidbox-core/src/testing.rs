//! Test doubles shared by the manager and monitor tests.
//!
//! [`FakeRuntime`] stands in for the container engine: it keeps sandbox
//! state in a map and lets tests script create failures, boot stalls,
//! probe exit codes, and a gate that parks `create` so deletes can race
//! provisioning deterministically. [`ScriptedRunner`] replaces the host
//! tool seam so namespace and routing commands never touch the kernel.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use droidbox_error::CommonError;
use droidbox_net::{CommandOutput, CommandRunner};
use droidbox_runtime::{
    ExecOutput, RawSandboxStats, RuntimeHandle, SandboxConfig, SandboxRuntime, SandboxState,
};
use tokio::sync::Notify;

use crate::config::Config;
use crate::manager::InstanceManager;

/// Scriptable in-memory container engine.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    states: Mutex<HashMap<String, SandboxState>>,
    /// Sandbox configs passed to `create`, in call order.
    pub created: Mutex<Vec<SandboxConfig>>,
    pub removed: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    create_refused: AtomicBool,
    start_refused: AtomicBool,
    boot_stalled: AtomicBool,
    probe_exit: AtomicI64,
    create_gated: AtomicBool,
    start_gated: AtomicBool,
    /// Signalled every time `create` is entered.
    pub entered_create: Notify,
    /// Signalled every time `start` is entered.
    pub entered_start: Notify,
    create_gate: Notify,
    start_gate: Notify,
}

impl FakeRuntime {
    /// Every subsequent `create` fails.
    pub fn refuse_create(&self) {
        self.create_refused.store(true, Ordering::SeqCst);
    }

    /// Every subsequent `start` fails.
    pub fn refuse_start(&self) {
        self.start_refused.store(true, Ordering::SeqCst);
    }

    /// Boot probes report an unbooted sandbox until cleared.
    pub fn stall_boot(&self) {
        self.boot_stalled.store(true, Ordering::SeqCst);
    }

    /// Exit code the health probe returns.
    pub fn set_probe_exit(&self, code: i64) {
        self.probe_exit.store(code, Ordering::SeqCst);
    }

    /// Parks `create` until [`Self::open_create_gate`] is called.
    pub fn gate_create(&self) {
        self.create_gated.store(true, Ordering::SeqCst);
    }

    pub fn open_create_gate(&self) {
        self.create_gated.store(false, Ordering::SeqCst);
        self.create_gate.notify_one();
    }

    /// Parks `start` until [`Self::open_start_gate`] is called.
    pub fn gate_start(&self) {
        self.start_gated.store(true, Ordering::SeqCst);
    }

    pub fn open_start_gate(&self) {
        self.start_gated.store(false, Ordering::SeqCst);
        self.start_gate.notify_one();
    }

    /// Simulates a sandbox crash.
    pub fn crash(&self, name: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), SandboxState::Exited);
    }

    pub fn state_of(&self, name: &str) -> Option<SandboxState> {
        self.states.lock().unwrap().get(name).copied()
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|config| config.name.clone())
            .collect()
    }

    pub fn removed_names(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn ping(&self) -> droidbox_runtime::Result<()> {
        Ok(())
    }

    async fn create(&self, config: &SandboxConfig) -> droidbox_runtime::Result<RuntimeHandle> {
        self.entered_create.notify_one();
        if self.create_gated.load(Ordering::SeqCst) {
            self.create_gate.notified().await;
        }
        if self.create_refused.load(Ordering::SeqCst) {
            return Err(CommonError::internal("engine refused create").into());
        }
        let serial = {
            let mut created = self.created.lock().unwrap();
            created.push(config.clone());
            created.len()
        };
        self.states
            .lock()
            .unwrap()
            .insert(config.name.clone(), SandboxState::Created);
        Ok(RuntimeHandle {
            id: format!("ctr{serial}-{}", config.name),
            name: config.name.clone(),
        })
    }

    async fn start(&self, name: &str) -> droidbox_runtime::Result<()> {
        self.entered_start.notify_one();
        if self.start_gated.load(Ordering::SeqCst) {
            self.start_gate.notified().await;
        }
        if self.start_refused.load(Ordering::SeqCst) {
            return Err(CommonError::internal("engine refused start").into());
        }
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), SandboxState::Running);
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout_secs: u32) -> droidbox_runtime::Result<()> {
        self.stopped.lock().unwrap().push(name.to_string());
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), SandboxState::Exited);
        Ok(())
    }

    async fn remove(&self, name: &str) -> droidbox_runtime::Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        self.states.lock().unwrap().remove(name);
        Ok(())
    }

    async fn state(&self, name: &str) -> droidbox_runtime::Result<SandboxState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(SandboxState::Missing))
    }

    async fn exec(&self, _name: &str, command: &[String]) -> droidbox_runtime::Result<ExecOutput> {
        if command.first().map(String::as_str) == Some("getprop") {
            let output = if self.boot_stalled.load(Ordering::SeqCst) {
                "0\n"
            } else {
                "1\n"
            };
            return Ok(ExecOutput {
                exit_code: 0,
                output: output.to_string(),
            });
        }
        if command.iter().any(|part| part == "health_check") {
            return Ok(ExecOutput {
                exit_code: self.probe_exit.load(Ordering::SeqCst),
                output: "health_check\n".to_string(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn raw_stats(&self, _name: &str) -> droidbox_runtime::Result<RawSandboxStats> {
        Ok(RawSandboxStats::default())
    }

    async fn logs(&self, _name: &str, tail: usize) -> droidbox_runtime::Result<String> {
        Ok(format!("boot log, last {tail} lines\n"))
    }
}

/// Records host commands; scripted failures and outputs match on a substring
/// of the joined command line.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    pub calls: Mutex<Vec<String>>,
    pub writes: Mutex<Vec<(String, String)>>,
    fail_on: Mutex<Vec<String>>,
    stdout_for: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    /// Any command line containing `needle` exits non-zero.
    pub fn fail_matching(&self, needle: &str) {
        self.fail_on.lock().unwrap().push(needle.to_string());
    }

    /// Any command line containing `needle` produces `stdout`.
    pub fn stdout_matching(&self, needle: &str, stdout: &str) {
        self.stdout_for
            .lock()
            .unwrap()
            .push((needle.to_string(), stdout.to_string()));
    }

    pub fn calls_containing(&self, needle: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());

        if self
            .fail_on
            .lock()
            .unwrap()
            .iter()
            .any(|needle| line.contains(needle))
        {
            return Ok(CommandOutput::failed("scripted failure"));
        }

        let stdout = self
            .stdout_for
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| line.contains(needle))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput::ok(stdout))
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((path.display().to_string(), contents.to_string()));
        Ok(())
    }

    fn remove_path(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// A manager wired to fakes, plus handles to script them.
pub(crate) struct Harness {
    pub manager: InstanceManager,
    pub runtime: Arc<FakeRuntime>,
    pub runner: Arc<ScriptedRunner>,
}

pub(crate) fn harness() -> Harness {
    harness_with(Config::default())
}

pub(crate) fn harness_with(config: Config) -> Harness {
    let runtime = Arc::new(FakeRuntime::default());
    let runner = Arc::new(ScriptedRunner::default());
    let manager = InstanceManager::new(
        &config,
        Arc::clone(&runtime) as Arc<dyn SandboxRuntime>,
        Arc::clone(&runner) as Arc<dyn CommandRunner>,
    )
    .expect("manager builds from defaults");
    Harness {
        manager,
        runtime,
        runner,
    }
}
