//! Host port allocation for sandbox endpoints.
//!
//! Each instance claims one ADB port and one VNC port from disjoint host
//! ranges. Pools pick a random free port rather than the lowest, so a
//! freshly released port is not immediately reused by the next create.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Mutex;

use droidbox_error::CommonError;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default host range for ADB endpoints.
pub const ADB_PORT_RANGE: Range<u16> = 5555..5655;

/// Default host range for VNC endpoints.
pub const VNC_PORT_RANGE: Range<u16> = 5900..6000;

/// The pair of host ports owned by one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPorts {
    pub adb: u16,
    pub vnc: u16,
}

/// A mutex-guarded pool over one contiguous port range.
#[derive(Debug)]
pub struct PortPool {
    name: &'static str,
    range: Range<u16>,
    in_use: Mutex<HashSet<u16>>,
}

impl PortPool {
    #[must_use]
    pub fn new(name: &'static str, range: Range<u16>) -> Self {
        Self {
            name,
            range,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Claims a random free port from the range.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::ResourceExhausted`] when every port in the
    /// range is claimed.
    pub fn allocate(&self) -> Result<u16, CommonError> {
        let mut in_use = self.lock()?;
        let free: Vec<u16> = self
            .range
            .clone()
            .filter(|port| !in_use.contains(port))
            .collect();
        if free.is_empty() {
            return Err(CommonError::resource_exhausted(format!(
                "no free {} ports in {}..{}",
                self.name, self.range.start, self.range.end
            )));
        }
        let port = free[rand::thread_rng().gen_range(0..free.len())];
        in_use.insert(port);
        Ok(port)
    }

    /// Returns a port to the pool. Releasing an unclaimed port is a no-op.
    pub fn release(&self, port: u16) {
        if let Ok(mut in_use) = self.lock() {
            in_use.remove(&port);
        }
    }

    /// Number of ports currently claimed.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Internal`] when the pool lock is poisoned.
    pub fn in_use_count(&self) -> Result<usize, CommonError> {
        Ok(self.lock()?.len())
    }

    /// Total ports the range covers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.range.len()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashSet<u16>>, CommonError> {
        self.in_use
            .lock()
            .map_err(|_| CommonError::internal(format!("{} port pool lock poisoned", self.name)))
    }
}

/// Paired ADB/VNC allocation with rollback on partial failure.
#[derive(Debug)]
pub struct PortAllocator {
    adb: PortPool,
    vnc: PortPool,
}

impl PortAllocator {
    #[must_use]
    pub fn new(adb_range: Range<u16>, vnc_range: Range<u16>) -> Self {
        Self {
            adb: PortPool::new("adb", adb_range),
            vnc: PortPool::new("vnc", vnc_range),
        }
    }

    /// Claims an ADB/VNC pair. Either both ports are claimed or neither is.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::ResourceExhausted`] when either pool is empty.
    pub fn allocate_pair(&self) -> Result<SandboxPorts, CommonError> {
        let adb = self.adb.allocate()?;
        let vnc = match self.vnc.allocate() {
            Ok(port) => port,
            Err(err) => {
                self.adb.release(adb);
                return Err(err);
            }
        };
        Ok(SandboxPorts { adb, vnc })
    }

    /// Returns both ports of a pair to their pools.
    pub fn release_pair(&self, ports: SandboxPorts) {
        self.adb.release(ports.adb);
        self.vnc.release(ports.vnc);
    }

    /// Claimed-port counts as `(adb, vnc)`.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Internal`] when a pool lock is poisoned.
    pub fn in_use(&self) -> Result<(usize, usize), CommonError> {
        Ok((self.adb.in_use_count()?, self.vnc.in_use_count()?))
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(ADB_PORT_RANGE, VNC_PORT_RANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_distinct() {
        let pool = PortPool::new("adb", 5555..5565);
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let port = pool.allocate().unwrap();
            assert!((5555..5565).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn exhausted_pool_reports_kind() {
        let pool = PortPool::new("vnc", 5900..5902);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        let err = pool.allocate().unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(err.to_string().contains("vnc"));
    }

    #[test]
    fn release_restores_capacity() {
        let pool = PortPool::new("adb", 5555..5556);
        let port = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());
        pool.release(port);
        assert_eq!(pool.allocate().unwrap(), port);
    }

    #[test]
    fn pair_allocation_rolls_back_on_vnc_exhaustion() {
        let allocator = PortAllocator::new(5555..5560, 5900..5901);
        let first = allocator.allocate_pair().unwrap();
        assert_eq!(allocator.in_use().unwrap(), (1, 1));

        let err = allocator.allocate_pair().unwrap_err();
        assert!(err.is_resource_exhausted());
        // The adb port claimed before the vnc failure must be returned.
        assert_eq!(allocator.in_use().unwrap(), (1, 1));

        allocator.release_pair(first);
        assert_eq!(allocator.in_use().unwrap(), (0, 0));
    }

    #[test]
    fn default_ranges_do_not_overlap() {
        let allocator = PortAllocator::default();
        assert_eq!(allocator.adb.capacity(), 100);
        assert_eq!(allocator.vnc.capacity(), 100);
        let ports = allocator.allocate_pair().unwrap();
        assert!((5555..5655).contains(&ports.adb));
        assert!((5900..6000).contains(&ports.vnc));
        assert_ne!(ports.adb, ports.vnc);
    }
}
