//! Private address pool for sandbox namespaces.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use droidbox_error::CommonError;
use ipnetwork::Ipv4Network;
use rand::Rng;

use crate::error::{NetError, Result};

/// Random draws attempted before falling back to a linear scan.
const RANDOM_ATTEMPTS: u32 = 64;

/// Allocates unique private IPv4 addresses from a fixed subnet.
///
/// The first host address is the gateway and the second is held back for
/// future infrastructure use; neither is ever issued to a sandbox. The in-use
/// set is mutex-guarded so concurrent provisioning cannot double-issue an
/// address.
pub struct AddressPool {
    subnet: Ipv4Network,
    reserved: HashSet<Ipv4Addr>,
    in_use: Mutex<HashSet<Ipv4Addr>>,
}

impl AddressPool {
    /// Creates a pool over `subnet`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the subnet has fewer than two usable
    /// host addresses beyond the reserved ones.
    pub fn new(subnet: Ipv4Network) -> Result<Self> {
        // offsets 1 and 2 are reserved, 0 is the network address and
        // size-1 the broadcast address
        if subnet.size() < 5 {
            return Err(NetError::Common(CommonError::config(format!(
                "subnet {subnet} is too small for an address pool"
            ))));
        }

        let reserved = [1, 2]
            .iter()
            .filter_map(|&n| subnet.nth(n))
            .collect::<HashSet<_>>();

        Ok(Self {
            subnet,
            reserved,
            in_use: Mutex::new(HashSet::new()),
        })
    }

    /// Returns the gateway address (first host of the subnet).
    ///
    /// # Panics
    ///
    /// Never panics: `new` rejects subnets without a first host.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.subnet.nth(1).unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Returns the pool's subnet.
    #[must_use]
    pub const fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Draws a random free address and marks it in use.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when every usable address is taken.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| CommonError::internal("address pool lock poisoned"))?;

        let last_offset = self.subnet.size() - 1;
        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let offset = rng.gen_range(1..last_offset);
            if let Some(ip) = self.subnet.nth(offset) {
                if !self.reserved.contains(&ip) && in_use.insert(ip) {
                    return Ok(ip);
                }
            }
        }

        // Densely used pool; scan for any remaining address.
        for offset in 1..last_offset {
            if let Some(ip) = self.subnet.nth(offset) {
                if !self.reserved.contains(&ip) && in_use.insert(ip) {
                    return Ok(ip);
                }
            }
        }

        Err(NetError::Common(CommonError::resource_exhausted(format!(
            "no free address in {}",
            self.subnet
        ))))
    }

    /// Returns an address to the pool. Releasing an address that was never
    /// allocated is a no-op.
    pub fn release(&self, ip: Ipv4Addr) {
        if let Ok(mut in_use) = self.in_use.lock() {
            in_use.remove(&ip);
        }
    }

    /// Number of addresses currently issued.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().map(|set| set.len()).unwrap_or(0)
    }
}
