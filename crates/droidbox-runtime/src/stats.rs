//! Resource usage sampling and normalization.
//!
//! The container engine reports usage as a large nested JSON document whose
//! sections come and go with cgroup version and sandbox state. All parsing
//! of that document happens here: [`RawSandboxStats`] mirrors the wire
//! shape with every field optional, and [`RawSandboxStats::normalize`]
//! reduces it to [`SandboxStats`], computing each section independently so
//! one missing section never poisons the others.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One normalized section: the computed values, or a note naming why they
/// are unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsSection<T> {
    Values(T),
    Unavailable { error: String },
}

impl<T> StatsSection<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            error: reason.into(),
        }
    }

    /// The computed values, when the section was present.
    pub const fn values(&self) -> Option<&T> {
        match self {
            Self::Values(values) => Some(values),
            Self::Unavailable { .. } => None,
        }
    }

    /// Whether the section carries values rather than a marker.
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Values(_))
    }
}

/// Normalized usage snapshot for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub running: bool,
    pub cpu: StatsSection<CpuStats>,
    pub memory: StatsSection<MemoryStats>,
    pub network: StatsSection<NetworkStats>,
    pub disk: StatsSection<DiskStats>,
}

impl SandboxStats {
    /// The snapshot reported for an instance whose sandbox is not running.
    #[must_use]
    pub fn not_running() -> Self {
        Self {
            running: false,
            cpu: StatsSection::unavailable("sandbox not running"),
            memory: StatsSection::unavailable("sandbox not running"),
            network: StatsSection::unavailable("sandbox not running"),
            disk: StatsSection::unavailable("sandbox not running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Usage over the sampling window, scaled by core count, in percent.
    pub percent: f64,
    pub cores: u32,
    pub throttled_periods: u64,
    pub throttled_time_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub used_mib: f64,
    pub limit_mib: f64,
    pub percent: f64,
    pub cache_bytes: u64,
}

/// Counters summed across every interface the sandbox sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Wire-shaped usage document as the engine reports it.
///
/// Every field defaults so partial documents still deserialize.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSandboxStats {
    pub cpu_stats: Option<RawCpuStats>,
    pub precpu_stats: Option<RawCpuStats>,
    pub memory_stats: Option<RawMemoryStats>,
    pub networks: Option<HashMap<String, RawNetworkStats>>,
    pub blkio_stats: Option<RawBlkioStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCpuStats {
    pub cpu_usage: RawCpuUsage,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
    pub throttling_data: RawThrottlingData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCpuUsage {
    pub total_usage: u64,
    /// Absent under cgroup v2.
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawThrottlingData {
    pub periods: u64,
    pub throttled_periods: u64,
    pub throttled_time: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMemoryStats {
    pub usage: u64,
    pub limit: u64,
    pub stats: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawNetworkStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawBlkioStats {
    pub io_service_bytes_recursive: Option<Vec<RawBlkioEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawBlkioEntry {
    pub op: String,
    pub value: u64,
}

impl RawSandboxStats {
    /// Reduces the raw document to normalized per-section values.
    #[must_use]
    pub fn normalize(&self) -> SandboxStats {
        SandboxStats {
            running: true,
            cpu: self.cpu_section(),
            memory: self.memory_section(),
            network: self.network_section(),
            disk: self.disk_section(),
        }
    }

    fn cpu_section(&self) -> StatsSection<CpuStats> {
        let (Some(cpu), Some(precpu)) = (&self.cpu_stats, &self.precpu_stats) else {
            return StatsSection::unavailable("cpu counters missing");
        };
        let cores = cpu
            .online_cpus
            .or_else(|| {
                cpu.cpu_usage
                    .percpu_usage
                    .as_ref()
                    .and_then(|per| u32::try_from(per.len()).ok())
            })
            .unwrap_or(1)
            .max(1);
        let cpu_delta = cpu
            .cpu_usage
            .total_usage
            .saturating_sub(precpu.cpu_usage.total_usage);
        let system_delta = cpu
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(precpu.system_cpu_usage.unwrap_or(0));
        #[allow(clippy::cast_precision_loss)]
        let percent = if system_delta > 0 {
            cpu_delta as f64 / system_delta as f64 * f64::from(cores) * 100.0
        } else {
            0.0
        };
        StatsSection::Values(CpuStats {
            percent: round2(percent),
            cores,
            throttled_periods: cpu.throttling_data.throttled_periods,
            throttled_time_ns: cpu.throttling_data.throttled_time,
        })
    }

    fn memory_section(&self) -> StatsSection<MemoryStats> {
        let Some(memory) = &self.memory_stats else {
            return StatsSection::unavailable("memory counters missing");
        };
        #[allow(clippy::cast_precision_loss)]
        let percent = if memory.limit > 0 {
            memory.usage as f64 / memory.limit as f64 * 100.0
        } else {
            0.0
        };
        StatsSection::Values(MemoryStats {
            used_mib: to_mib(memory.usage),
            limit_mib: to_mib(memory.limit),
            percent: round2(percent),
            cache_bytes: memory.stats.get("cache").copied().unwrap_or(0),
        })
    }

    fn network_section(&self) -> StatsSection<NetworkStats> {
        let Some(networks) = &self.networks else {
            return StatsSection::unavailable("no network interfaces");
        };
        let mut totals = NetworkStats {
            rx_bytes: 0,
            rx_packets: 0,
            tx_bytes: 0,
            tx_packets: 0,
        };
        for iface in networks.values() {
            totals.rx_bytes += iface.rx_bytes;
            totals.rx_packets += iface.rx_packets;
            totals.tx_bytes += iface.tx_bytes;
            totals.tx_packets += iface.tx_packets;
        }
        StatsSection::Values(totals)
    }

    fn disk_section(&self) -> StatsSection<DiskStats> {
        let Some(blkio) = &self.blkio_stats else {
            return StatsSection::unavailable("block io counters missing");
        };
        let mut disk = DiskStats {
            read_bytes: 0,
            write_bytes: 0,
        };
        for entry in blkio.io_service_bytes_recursive.iter().flatten() {
            match entry.op.to_lowercase().as_str() {
                "read" => disk.read_bytes += entry.value,
                "write" => disk.write_bytes += entry.value,
                _ => {}
            }
        }
        StatsSection::Values(disk)
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_mib(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
