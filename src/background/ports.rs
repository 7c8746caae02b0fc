//! Free-port allocation.
//!
//! Only the build worker allocates; the clean worker releases. A port is
//! considered free when the OS lets us bind it *and* no alive session holds
//! it. A freshly allocated port is closed again immediately (the session's
//! own process binds it later), so the reservation set prevents two builds
//! racing onto the same port in that window.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use thiserror::Error;

use crate::config::PortConfiguration;

/// How many candidate ports a preferred-port scan probes before giving up.
const PREFERRED_SCAN_WIDTH: u16 = 100;

/// Port allocation failed.
#[derive(Debug, Error)]
#[error("could not find a free TCP port")]
pub struct PortUnavailable;

/// Tracks ports handed to sessions between allocation and release.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a free port honoring the application's preferences.
    ///
    /// With a preferred starting point, ports are scanned upward from it;
    /// otherwise the OS picks. Ports in the `except` list are skipped.
    pub fn allocate(&self, preferences: &PortConfiguration) -> Result<u16, PortUnavailable> {
        let mut reserved = self.reserved.lock().expect("port allocator poisoned");

        if let Some(preferred) = preferences.preferred {
            for candidate in preferred..preferred.saturating_add(PREFERRED_SCAN_WIDTH) {
                if preferences.except.contains(&candidate) || reserved.contains(&candidate) {
                    continue;
                }
                if bindable(candidate) {
                    reserved.insert(candidate);
                    return Ok(candidate);
                }
            }
            return Err(PortUnavailable);
        }

        // No preference: let the OS pick, retrying past excluded ports.
        for _ in 0..16 {
            let Some(candidate) = os_assigned_port() else {
                return Err(PortUnavailable);
            };
            if preferences.except.contains(&candidate) || reserved.contains(&candidate) {
                continue;
            }
            reserved.insert(candidate);
            return Ok(candidate);
        }
        Err(PortUnavailable)
    }

    /// Releases a session's port. Idempotent.
    pub fn release(&self, port: u16) {
        self.reserved
            .lock()
            .expect("port allocator poisoned")
            .remove(&port);
    }

    /// Whether a port is currently reserved (test observability).
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .expect("port allocator poisoned")
            .contains(&port)
    }
}

fn bindable(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn os_assigned_port() -> Option<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).ok()?;
    Some(listener.local_addr().ok()?.port())
}
