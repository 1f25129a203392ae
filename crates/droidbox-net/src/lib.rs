//! # droidbox-net
//!
//! Per-sandbox network isolation for droidbox.
//!
//! This crate gives every sandbox its own network identity:
//!
//! - **Namespace isolation**: one network namespace per sandbox, wired to the
//!   host through a veth pair
//! - **Addressing**: private IPv4 addresses drawn from a guarded pool
//! - **Scoped filtering**: forwarding/NAT rules limited to the sandbox address
//! - **Egress routing**: HTTP DNAT, SOCKS transparent redirect, or custom
//!   block/rate/bandwidth rules
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 droidbox-net                    │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │           NetworkIsolator               │    │
//! │  │  - namespace + veth lifecycle           │    │
//! │  │  - per-address filter rules             │    │
//! │  │  - DNS, connectivity probing            │    │
//! │  └─────────────────────────────────────────┘    │
//! │  ┌──────────────┐  ┌─────────────────────┐      │
//! │  │ AddressPool  │  │    TrafficRouter    │      │
//! │  │  (subnet)    │  │ http/socks/custom   │      │
//! │  └──────────────┘  └─────────────────────┘      │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │       CommandRunner (ip/iptables/tc)    │    │
//! │  └─────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! All host-tool interaction goes through the [`CommandRunner`] seam so rule
//! construction stays testable without root privileges.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod error;
pub mod netns;
pub mod router;
pub mod runner;

pub use addr::AddressPool;
pub use error::{NetError, Result};
pub use netns::{ConnectivityReport, IsolatorConfig, NetworkIsolator};
pub use router::{CustomRules, ProxyEndpoint, RoutingPolicy, TrafficRouter};
pub use runner::{CommandOutput, CommandRunner, HostRunner};
