//! Configuration management.
//!
//! droidbox configuration is loaded from multiple sources with the following
//! priority:
//!
//! 1. Environment variables (`DROIDBOX_*`, `__` as the section separator,
//!    e.g. `DROIDBOX_MONITOR__INTERVAL_SECS=60`)
//! 2. User config file (`~/.config/droidbox/config.toml`)
//! 3. System config file (`/etc/droidbox/config.toml`)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! # droidbox configuration file
//! data_dir = "~/.droidbox"
//!
//! [runtime]
//! boot_timeout_secs = 120
//! ready_timeout_secs = 60
//! stop_grace_secs = 30
//!
//! [network]
//! subnet = "172.20.0.0/24"
//! dns = ["8.8.8.8", "1.1.1.1"]
//!
//! [monitor]
//! enabled = true
//! interval_secs = 30
//! restart_policy = "always"
//!
//! [logging]
//! level = "info"
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use droidbox_error::CommonError;
use droidbox_net::IsolatorConfig;
use droidbox_runtime::OrchestratorTiming;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// droidbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory.
    pub data_dir: PathBuf,
    /// Container runtime configuration.
    pub runtime: RuntimeConfig,
    /// Network isolation configuration.
    pub network: NetworkConfig,
    /// Health monitor configuration.
    pub monitor: MonitorConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            runtime: RuntimeConfig::default(),
            network: NetworkConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()))
            .merge(Toml::file(user_config_path()))
            .merge(Env::prefixed("DROIDBOX_").split("__"))
            .extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DROIDBOX_").split("__"))
            .extract()
    }

    /// Returns the per-instance data directory root.
    #[must_use]
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    /// Returns the directory holding routing helper state.
    #[must_use]
    pub fn routing_state_dir(&self) -> PathBuf {
        self.data_dir.join("routing")
    }

    /// Returns the daemon PID file path.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("droidboxd.pid")
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine socket path; unset selects the platform default.
    pub socket_path: Option<PathBuf>,
    /// Ceiling on the Android boot wait, in seconds.
    pub boot_timeout_secs: u64,
    /// Ceiling on the started-to-running wait, in seconds.
    pub ready_timeout_secs: u64,
    /// Seconds a sandbox gets to exit cleanly on stop.
    pub stop_grace_secs: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            boot_timeout_secs: 120,
            ready_timeout_secs: 60,
            stop_grace_secs: 30,
        }
    }
}

impl RuntimeConfig {
    /// Orchestrator timing with this config's overrides applied.
    #[must_use]
    pub fn timing(&self) -> OrchestratorTiming {
        OrchestratorTiming {
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            stop_grace: self.stop_grace_secs,
            ..OrchestratorTiming::default()
        }
    }
}

/// Network isolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Subnet sandbox addresses are drawn from.
    pub subnet: String,
    /// Resolver addresses written into each namespace.
    pub dns: Vec<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: "172.20.0.0/24".to_string(),
            dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
        }
    }
}

impl NetworkConfig {
    /// Parses the configured subnet.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Config`] when the subnet string is not valid
    /// CIDR notation.
    pub fn subnet(&self) -> Result<Ipv4Network, CommonError> {
        self.subnet
            .parse()
            .map_err(|err| CommonError::config(format!("invalid subnet {}: {err}", self.subnet)))
    }

    /// Isolator settings for a given gateway address.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Config`] when the subnet string is malformed.
    pub fn isolator(&self, gateway: Ipv4Addr) -> Result<IsolatorConfig, CommonError> {
        Ok(IsolatorConfig {
            subnet: self.subnet()?,
            gateway,
            dns_servers: self.dns.clone(),
        })
    }
}

/// Whether the monitor restarts instances that stopped responding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart any instance that fails its health probe.
    #[default]
    Always,
    /// Only mark failures; critically unhealthy instances still restart.
    Never,
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the background monitor loop.
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    pub restart_policy: RestartPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            restart_policy: RestartPolicy::Always,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(".droidbox")
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("droidbox")
        .join("config.toml")
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/droidbox/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime.boot_timeout_secs, 120);
        assert_eq!(config.network.subnet, "172.20.0.0/24");
        assert_eq!(config.network.dns.len(), 2);
        assert!(config.monitor.enabled);
        assert_eq!(config.monitor.interval_secs, 30);
        assert_eq!(config.monitor.restart_policy, RestartPolicy::Always);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_paths() {
        let config = Config::default();
        assert!(config.instances_dir().ends_with("instances"));
        assert!(config.routing_state_dir().ends_with("routing"));
        assert!(config.pid_file().ends_with("droidboxd.pid"));
    }

    #[test]
    fn test_timing_overrides() {
        let runtime = RuntimeConfig {
            boot_timeout_secs: 30,
            ..RuntimeConfig::default()
        };
        let timing = runtime.timing();
        assert_eq!(timing.boot_timeout, Duration::from_secs(30));
        assert_eq!(timing.ready_timeout, Duration::from_secs(60));
        assert_eq!(timing.stop_grace, 30);
    }

    #[test]
    fn test_subnet_parses() {
        let network = NetworkConfig::default();
        let subnet = network.subnet().unwrap();
        assert_eq!(subnet.prefix(), 24);

        let bad = NetworkConfig {
            subnet: "not-a-subnet".to_string(),
            ..NetworkConfig::default()
        };
        assert!(bad.subnet().is_err());
    }

    #[test]
    fn test_isolator_settings() {
        let network = NetworkConfig::default();
        let isolator = network.isolator(Ipv4Addr::new(172, 20, 0, 1)).unwrap();
        assert_eq!(isolator.gateway, Ipv4Addr::new(172, 20, 0, 1));
        assert_eq!(isolator.dns_servers, network.dns);
    }

    #[test]
    fn test_file_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    data_dir = "/srv/droidbox"

                    [monitor]
                    interval_secs = 10
                "#,
            )?;
            jail.set_env("DROIDBOX_MONITOR__RESTART_POLICY", "never");
            jail.set_env("DROIDBOX_NETWORK__SUBNET", "10.99.0.0/24");

            let config = Config::load_from("config.toml").expect("config loads");
            assert_eq!(config.data_dir, PathBuf::from("/srv/droidbox"));
            assert_eq!(config.monitor.interval_secs, 10);
            assert_eq!(config.monitor.restart_policy, RestartPolicy::Never);
            assert_eq!(config.network.subnet, "10.99.0.0/24");
            // Untouched sections keep their defaults.
            assert_eq!(config.runtime.boot_timeout_secs, 120);
            Ok(())
        });
    }
}
