//! Process-wide ownership claims on serial ports.
//!
//! Only one acquisition session may drive a given port. A session takes a
//! [`PortClaim`] before opening its transport; the claim is released when the
//! guard drops at the end of the session.

use crate::error::ProbeError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Module-local registry of claimed port names.
static CLAIMED_PORTS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn claim_registry() -> &'static Mutex<HashSet<String>> {
    CLAIMED_PORTS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a port name, released on drop.
#[derive(Debug)]
pub struct PortClaim {
    port: String,
}

impl PortClaim {
    /// Claimed port name.
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        claim_registry().lock().remove(&self.port);
        tracing::debug!(port = %self.port, "released port claim");
    }
}

/// Claim `port` for the calling session.
///
/// # Errors
/// [`ProbeError::Ownership`] if another live claim exists for the same name.
pub fn claim(port: &str) -> Result<PortClaim, ProbeError> {
    let mut claimed = claim_registry().lock();
    if !claimed.insert(port.to_string()) {
        return Err(ProbeError::Ownership(port.to_string()));
    }
    tracing::debug!(port, "claimed port");
    Ok(PortClaim {
        port: port.to_string(),
    })
}

/// Whether `port` is currently claimed.
pub fn is_claimed(port: &str) -> bool {
    CLAIMED_PORTS
        .get()
        .is_some_and(|registry| registry.lock().contains(port))
}
