//! Loopback port pool for per-session web terminals.

use std::{collections::HashMap, sync::Mutex};

use ccmux_common::{Error, Result};

/// Hands out TCP ports from a bounded, contiguous range.
///
/// Leases are process-local and reset on restart; surviving gateways are
/// rediscovered by their supervisor and reseed their ports on demand.
pub struct PortAllocator {
    inner: Mutex<Pool>,
}

struct Pool {
    start: u16,
    max: u16,
    /// port → owning session id.
    leased: HashMap<u16, String>,
}

impl PortAllocator {
    /// `start..=max`, inclusive on both ends.
    pub fn new(start: u16, max: u16) -> Self {
        Self {
            inner: Mutex::new(Pool {
                start,
                max,
                leased: HashMap::new(),
            }),
        }
    }

    /// Lease the lowest port not currently held. Fails with `NoFreePort`
    /// when the whole range is leased.
    pub fn acquire(&self, sid: &str) -> Result<u16> {
        let mut pool = self.inner.lock().expect("port pool lock poisoned");
        for port in pool.start..=pool.max {
            if !pool.leased.contains_key(&port) {
                pool.leased.insert(port, sid.to_string());
                return Ok(port);
            }
        }
        Err(Error::NoFreePort)
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        let mut pool = self.inner.lock().expect("port pool lock poisoned");
        pool.leased.remove(&port);
    }

    /// Current leases as `(port, sid)` pairs, sorted by port.
    pub fn leases(&self) -> Vec<(u16, String)> {
        let pool = self.inner.lock().expect("port pool lock poisoned");
        let mut leases: Vec<_> = pool
            .leased
            .iter()
            .map(|(port, sid)| (*port, sid.clone()))
            .collect();
        leases.sort_by_key(|(port, _)| *port);
        leases
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.inner
            .lock()
            .expect("port pool lock poisoned")
            .leased
            .contains_key(&port)
    }

    /// The configured `(start, max)` range.
    pub fn range(&self) -> (u16, u16) {
        let pool = self.inner.lock().expect("port pool lock poisoned");
        (pool.start, pool.max)
    }
}
