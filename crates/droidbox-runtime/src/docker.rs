//! Docker engine implementation of [`SandboxRuntime`].
//!
//! Sandboxes run privileged with kernel device access, which the Android
//! image needs for hardware-accelerated graphics and binder. Containers
//! are created stopped so namespace wiring can happen before first boot.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    models::{
        ContainerCreateBody, DeviceMapping, HostConfig, PortBinding, RestartPolicy,
        RestartPolicyNameEnum,
    },
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
        StatsOptionsBuilder, StopContainerOptionsBuilder,
    },
};
use droidbox_error::CommonError;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::device::CPU_PERIOD;
use crate::error::{Result, RuntimeError};
use crate::runtime::{ExecOutput, RuntimeHandle, SandboxConfig, SandboxRuntime, SandboxState};
use crate::stats::RawSandboxStats;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Host devices handed through to the sandbox when present.
const SANDBOX_DEVICES: [&str; 2] = ["/dev/kvm", "/dev/dri"];

/// Docker-backed sandbox runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the standard environment (`DOCKER_HOST` or the
    /// platform default socket).
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Engine`] when no endpoint can be derived.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }

    /// Connects to an explicit Unix socket path.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Engine`] when the client cannot be built.
    pub fn with_socket(path: &str) -> Result<Self> {
        Ok(Self {
            docker: Docker::connect_with_socket(path, DEFAULT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        info!(image, "pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn create(&self, config: &SandboxConfig) -> Result<RuntimeHandle> {
        self.ensure_image(&config.image).await?;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let options = CreateContainerOptionsBuilder::new().name(&config.name).build();
        let response = self
            .docker
            .create_container(Some(options), container_body(config))
            .await?;
        for warning in &response.warnings {
            warn!(sandbox = %config.name, warning, "engine warning during create");
        }
        debug!(sandbox = %config.name, id = %response.id, "sandbox container created");
        Ok(RuntimeHandle {
            id: response.id,
            name: config.name.clone(),
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_modified(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn stop(&self, name: &str, timeout_secs: u32) -> Result<()> {
        let options = StopContainerOptionsBuilder::new()
            .t(i32::try_from(timeout_secs).unwrap_or(i32::MAX))
            .build();
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_modified(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!(sandbox = name, "sandbox already removed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn state(&self, name: &str) -> Result<SandboxState> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let status = details
                    .state
                    .and_then(|state| state.status)
                    .map(|status| status.to_string())
                    .unwrap_or_default();
                Ok(SandboxState::parse(&status))
            }
            Err(err) if is_not_found(&err) => Ok(SandboxState::Missing),
            Err(err) => Err(err.into()),
        }
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                collected.push_str(&chunk?.to_string());
            }
        }

        let details = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: details.exit_code.unwrap_or(-1),
            output: collected,
        })
    }

    async fn raw_stats(&self, name: &str) -> Result<RawSandboxStats> {
        let options = StatsOptionsBuilder::new().stream(false).build();
        let mut samples = self.docker.stats(name, Some(options));
        let Some(sample) = samples.next().await else {
            return Err(RuntimeError::not_running(name));
        };
        let value = serde_json::to_value(sample?)
            .map_err(|err| CommonError::internal(format!("stats encode: {err}")))?;
        let raw = serde_json::from_value(value)
            .map_err(|err| CommonError::internal(format!("stats decode: {err}")))?;
        Ok(raw)
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();
        let mut stream = self.docker.logs(name, Some(options));
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk?.to_string());
        }
        Ok(collected)
    }
}

/// Renders the full container spec for one sandbox.
fn container_body(config: &SandboxConfig) -> ContainerCreateBody {
    let env: Vec<String> = config
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in
        [("5555/tcp", config.adb_port), ("5900/tcp", config.vnc_port)]
    {
        exposed_ports.insert(container_port.to_string(), HashMap::new());
        port_bindings.insert(
            container_port.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let devices: Vec<DeviceMapping> = SANDBOX_DEVICES
        .iter()
        .filter(|path| Path::new(path).exists())
        .map(|path| DeviceMapping {
            path_on_host: Some((*path).to_string()),
            path_in_container: Some((*path).to_string()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect();

    ContainerCreateBody {
        image: Some(config.image.clone()),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:/data", config.data_dir.display())]),
            port_bindings: Some(port_bindings),
            privileged: Some(true),
            devices: if devices.is_empty() { None } else { Some(devices) },
            cap_add: Some(vec!["SYS_ADMIN".to_string(), "NET_ADMIN".to_string()]),
            security_opt: Some(vec!["seccomp=unconfined".to_string()]),
            memory: Some(i64::try_from(config.memory_bytes).unwrap_or(i64::MAX)),
            cpu_quota: Some(config.cpu_quota),
            cpu_period: Some(CPU_PERIOD),
            network_mode: Some(
                if config.isolated { "none" } else { "bridge" }.to_string(),
            ),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn sandbox_config(isolated: bool) -> SandboxConfig {
        let mut env = BTreeMap::new();
        env.insert("REDROID_WIDTH".to_string(), "1080".to_string());
        env.insert("REDROID_GPU_MODE".to_string(), "guest".to_string());
        SandboxConfig {
            name: "android-1a2b3c4d".to_string(),
            image: "redroid/redroid:13.0.0-latest".to_string(),
            env,
            adb_port: 5561,
            vnc_port: 5903,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            cpu_quota: 200_000,
            isolated,
            data_dir: PathBuf::from("/data/android-instances/android-1a2b3c4d"),
        }
    }

    #[test]
    fn body_publishes_adb_and_vnc_ports() {
        let body = container_body(&sandbox_config(false));
        let host_config = body.host_config.unwrap();
        let bindings = host_config.port_bindings.unwrap();

        let adb = bindings["5555/tcp"].as_ref().unwrap();
        assert_eq!(adb[0].host_port.as_deref(), Some("5561"));
        let vnc = bindings["5900/tcp"].as_ref().unwrap();
        assert_eq!(vnc[0].host_port.as_deref(), Some("5903"));

        let exposed = body.exposed_ports.unwrap();
        assert!(exposed.contains_key("5555/tcp"));
        assert!(exposed.contains_key("5900/tcp"));
    }

    #[test]
    fn isolated_sandbox_gets_no_engine_network() {
        let isolated = container_body(&sandbox_config(true));
        assert_eq!(
            isolated.host_config.unwrap().network_mode.as_deref(),
            Some("none")
        );

        let bridged = container_body(&sandbox_config(false));
        assert_eq!(
            bridged.host_config.unwrap().network_mode.as_deref(),
            Some("bridge")
        );
    }

    #[test]
    fn resource_limits_flow_into_host_config() {
        let body = container_body(&sandbox_config(false));
        let host_config = body.host_config.unwrap();
        assert_eq!(host_config.memory, Some(4 * 1024 * 1024 * 1024));
        assert_eq!(host_config.cpu_quota, Some(200_000));
        assert_eq!(host_config.cpu_period, Some(100_000));
    }

    #[test]
    fn sandbox_runs_privileged_with_net_admin() {
        let body = container_body(&sandbox_config(false));
        let host_config = body.host_config.unwrap();
        assert_eq!(host_config.privileged, Some(true));
        let caps = host_config.cap_add.unwrap();
        assert!(caps.contains(&"SYS_ADMIN".to_string()));
        assert!(caps.contains(&"NET_ADMIN".to_string()));
        assert_eq!(
            host_config.security_opt.unwrap(),
            vec!["seccomp=unconfined".to_string()]
        );
        assert_eq!(
            host_config.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }

    #[test]
    fn environment_renders_as_sorted_pairs() {
        let body = container_body(&sandbox_config(false));
        let env = body.env.unwrap();
        assert_eq!(env, vec!["REDROID_GPU_MODE=guest", "REDROID_WIDTH=1080"]);
    }

    #[test]
    fn data_volume_binds_into_sandbox() {
        let body = container_body(&sandbox_config(false));
        let binds = body.host_config.unwrap().binds.unwrap();
        assert_eq!(binds, vec!["/data/android-instances/android-1a2b3c4d:/data"]);
    }

    #[test]
    fn response_code_matchers_distinguish_absent_from_failed() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
        assert!(!is_not_modified(&missing));

        let unchanged = BollardError::DockerResponseServerError {
            status_code: 304,
            message: "already stopped".to_string(),
        };
        assert!(is_not_modified(&unchanged));
    }
}
