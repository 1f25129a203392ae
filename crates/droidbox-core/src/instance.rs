//! Instance records and lifecycle state.
//!
//! An [`Instance`] is the authoritative record for one managed sandbox:
//! the desired spec, the current state, and every resource handle the
//! provisioning flow has acquired so far. Records are owned by the
//! [`InstanceManager`](crate::manager::InstanceManager) and only cloned
//! out to callers.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use droidbox_error::CommonError;
use droidbox_net::RoutingPolicy;
use droidbox_runtime::{
    image_for_version, parse_memory_limit, DeviceProfile, ResourceLimits, RuntimeHandle,
    SandboxPorts,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Instance identifier length in hex characters.
const ID_LEN: usize = 12;

/// Unique identifier of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..ID_LEN].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in derived resource names.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }

    /// Container name for this instance's sandbox.
    #[must_use]
    pub fn sandbox_name(&self) -> String {
        format!("android-{}", self.short())
    }

    /// Network namespace name for this instance.
    #[must_use]
    pub fn netns_name(&self) -> String {
        format!("netns-{}", self.short())
    }
}

impl From<&str> for InstanceId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an instance.
///
/// `Creating → Configuring → Running → {Stopped, Failed}`, with restart
/// taking `Stopped`/`Failed` back to `Creating`. Delete is legal from any
/// state and removes the record entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Configuring,
    Running,
    Stopped,
    Failed,
}

impl InstanceState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// True while a provisioning task owns the record.
    #[must_use]
    pub const fn is_provisioning(self) -> bool {
        matches!(self, Self::Creating | Self::Configuring)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired configuration for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    /// Android release to boot, e.g. `"13"`.
    pub os_version: String,
    pub profile: DeviceProfile,
    pub resources: ResourceLimits,
    pub routing: RoutingPolicy,
    /// Resolver entries written into the namespace; empty selects the
    /// isolator defaults.
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self {
            os_version: "13".to_string(),
            profile: DeviceProfile::default(),
            resources: ResourceLimits::default(),
            routing: RoutingPolicy::None,
            dns_servers: Vec::new(),
        }
    }
}

impl InstanceSpec {
    /// Checks the spec before any resource is acquired.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Unsupported`] for unknown OS versions and
    /// [`CommonError::Config`] for malformed limits or incomplete proxy
    /// endpoints.
    pub fn validate(&self) -> Result<(), CommonError> {
        image_for_version(&self.os_version)?;
        self.resources.memory_bytes()?;
        parse_memory_limit(&self.resources.storage)?;
        if self.resources.cpus <= 0.0 {
            return Err(CommonError::config(format!(
                "cpu limit must be positive, got {}",
                self.resources.cpus
            )));
        }
        match &self.routing {
            RoutingPolicy::Http { endpoint } | RoutingPolicy::Socks { endpoint } => {
                if endpoint.host.is_empty() {
                    return Err(CommonError::config("proxy endpoint host is empty"));
                }
                if endpoint.port == 0 {
                    return Err(CommonError::config("proxy endpoint port is zero"));
                }
            }
            RoutingPolicy::None | RoutingPolicy::Custom { .. } => {}
        }
        Ok(())
    }

    /// Whether provisioning must wire a private namespace.
    #[must_use]
    pub const fn needs_namespace(&self) -> bool {
        self.routing.requires_isolation()
    }
}

/// One managed sandbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Container name, `android-` plus the id's first eight characters.
    pub name: String,
    #[serde(flatten)]
    pub spec: InstanceSpec,
    pub state: InstanceState,
    pub handle: Option<RuntimeHandle>,
    pub ports: Option<SandboxPorts>,
    /// Namespace name, set once isolation is wired.
    pub netns: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Instance {
    /// Creates a fresh record in `Creating`.
    #[must_use]
    pub fn new(spec: InstanceSpec) -> Self {
        let id = InstanceId::generate();
        let name = id.sandbox_name();
        Self {
            id,
            name,
            spec,
            state: InstanceState::Creating,
            handle: None,
            ports: None,
            netns: None,
            ip: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_heartbeat: None,
            error: None,
        }
    }
}

/// Broadcast payload emitted on every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    pub id: InstanceId,
    pub state: InstanceState,
    pub at: DateTime<Utc>,
}

/// Selection and pagination for instance listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<InstanceState>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ListFilter {
    /// Filter down to one state, no pagination.
    #[must_use]
    pub fn by_state(state: InstanceState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, instance: &Instance) -> bool {
        self.state.map_or(true, |state| state == instance.state)
    }
}
