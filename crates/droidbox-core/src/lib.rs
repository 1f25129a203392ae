//! # droidbox-core
//!
//! Instance orchestration for droidbox.
//!
//! This crate ties the engine and network layers together into managed
//! Android instances:
//!
//! - **Lifecycle**: create, start, stop, restart, and delete instances, with
//!   provisioning running asynchronously behind a state machine
//! - **Isolation**: instances that route egress get a private network
//!   namespace, address, and DNS wired during provisioning
//! - **Health**: a monitor sweeps running instances and restarts the ones
//!   that die underneath it
//! - **Configuration**: layered file and environment configuration for the
//!   daemon and every subsystem under it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 droidbox-core                   │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │          InstanceManager                │    │
//! │  │  - instance registry + state events     │    │
//! │  │  - provisioning / teardown tasks        │    │
//! │  │  - routing updates, stats, exec, logs   │    │
//! │  └─────────────────────────────────────────┘    │
//! │  ┌──────────────┐  ┌─────────────────────┐      │
//! │  │HealthMonitor │  │       Config        │      │
//! │  │  (sweeps)    │  │ file + env layers   │      │
//! │  └──────────────┘  └─────────────────────┘      │
//! └──────────┬──────────────────────┬───────────────┘
//!            │                      │
//!   droidbox-runtime         droidbox-net
//!   (engine, ports)     (netns, routing, DNS)
//! ```
//!
//! The engine is reached only through the [`droidbox_runtime::SandboxRuntime`]
//! trait and the host network tools only through
//! [`droidbox_net::CommandRunner`], so the whole lifecycle is testable
//! without Docker or root privileges.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod instance;
pub mod manager;
pub mod monitor;
#[cfg(test)]
mod testing;

pub use config::{
    Config, LoggingConfig, MonitorConfig, NetworkConfig, RestartPolicy, RuntimeConfig,
};
pub use error::{CoreError, Result};
pub use instance::{Instance, InstanceId, InstanceSpec, InstanceState, ListFilter, StateEvent};
pub use manager::{InstanceManager, DEFAULT_LOG_TAIL};
pub use monitor::{HealthMonitor, SweepReport};
