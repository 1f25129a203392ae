//! # droidbox-runtime
//!
//! Container runtime layer for Android sandbox instances.
//!
//! This crate turns an instance description into a running redroid
//! sandbox:
//!
//! - **Image catalog**: Android version to sandbox image mapping
//! - **Host ports**: randomized ADB/VNC allocation from disjoint ranges
//! - **Device identity**: profile expansion into `ro.*` boot properties
//! - **Lifecycle**: create, start, boot wait, health probes, teardown
//! - **Usage**: normalized CPU/memory/network/disk sampling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               droidbox-runtime                  │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │          SandboxOrchestrator            │    │
//! │  │  - readiness and boot waits             │    │
//! │  │  - health verdicts                      │    │
//! │  │  - stop-then-remove teardown            │    │
//! │  └───────────────────┬─────────────────────┘    │
//! │  ┌────────────┐ ┌────▼──────────┐ ┌─────────┐   │
//! │  │ Port       │ │ SandboxRuntime│ │ Device  │   │
//! │  │ Allocator  │ │ (trait)       │ │ Profile │   │
//! │  └────────────┘ └────┬──────────┘ └─────────┘   │
//! │  ┌───────────────────▼─────────────────────┐    │
//! │  │             DockerRuntime               │    │
//! │  └─────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod device;
pub mod docker;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod ports;
pub mod retry;
pub mod runtime;
pub mod stats;

pub use device::{cpu_quota, parse_memory_limit, DeviceProfile, ResourceLimits, CPU_PERIOD};
pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use image::{image_for_version, SUPPORTED_VERSIONS};
pub use orchestrator::{HealthVerdict, OrchestratorTiming, SandboxOrchestrator};
pub use ports::{PortAllocator, PortPool, SandboxPorts, ADB_PORT_RANGE, VNC_PORT_RANGE};
pub use retry::poll_until;
pub use runtime::{ExecOutput, RuntimeHandle, SandboxConfig, SandboxRuntime, SandboxState};
pub use stats::{
    CpuStats, DiskStats, MemoryStats, NetworkStats, RawSandboxStats, SandboxStats, StatsSection,
};
