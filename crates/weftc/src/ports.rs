//! Published ports, access policy, and the live stream registry.
//!
//! Policy evaluation is split into pure functions so the decision ladder
//! is testable without a session: the global device screen (blocklist
//! before allowlist), then the per-port check, with `protected` ports
//! deferring to the on-chain access predicate.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;

use weft_common::base58;
use weft_common::types::DeviceId;

use crate::stream::DeviceStream;

/// Who may dial a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Any device may connect.
    Public,
    /// Devices on the per-port allowlist, or whitelisted on-chain.
    Protected,
    /// Only devices on the per-port allowlist.
    Private,
}

impl FromStr for PortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "protected" => Ok(Self::Protected),
            "private" => Ok(Self::Private),
            other => Err(format!(
                "unknown port mode {other:?}, expected public, protected, or private"
            )),
        }
    }
}

/// A local TCP service announced to the overlay for inbound dials.
#[derive(Debug, Clone)]
pub struct PublishedPort {
    /// The port number remote devices dial.
    pub port: u16,
    /// The local TCP port the service listens on.
    pub source: u16,
    /// Access mode.
    pub mode: PortMode,
    /// Per-port device allowlist.
    pub allowlist: HashSet<DeviceId>,
}

impl PublishedPort {
    /// True when the device is admitted by the port itself, before any
    /// ledger consultation.
    #[must_use]
    pub fn accepts(&self, device: &DeviceId) -> bool {
        match self.mode {
            PortMode::Public => true,
            PortMode::Protected | PortMode::Private => self.allowlist.contains(device),
        }
    }
}

/// Outcome of the per-port policy check.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PortAccess {
    /// Admitted by the port.
    Granted,
    /// Not on the port allowlist; a `protected` port defers to the ledger.
    NeedsLedger,
    /// Denied outright.
    Denied,
}

/// Evaluates the per-port policy for a device.
pub(crate) fn port_access(published: &PublishedPort, device: &DeviceId) -> PortAccess {
    if published.accepts(device) {
        PortAccess::Granted
    } else if published.mode == PortMode::Protected {
        PortAccess::NeedsLedger
    } else {
        PortAccess::Denied
    }
}

/// Global device screen. The blocklist wins when populated; the allowlist
/// is only consulted when the blocklist is empty.
pub(crate) fn screen_device(
    blocklist: &HashSet<DeviceId>,
    allowlist: &HashSet<DeviceId>,
    device: &DeviceId,
) -> Option<String> {
    if !blocklist.is_empty() {
        if blocklist.contains(device) {
            return Some(format!(
                "device {} is on the blocklist",
                base58::encode(device)
            ));
        }
    } else if !allowlist.is_empty() && !allowlist.contains(device) {
        return Some(format!(
            "device {} is not on the allowlist",
            base58::encode(device)
        ));
    }
    None
}

/// Published ports and currently open device streams.
///
/// Both maps are single-key atomic, which is what makes
/// unpublish-then-publish invisible to racing inbound opens and keeps
/// stream refs unique.
pub(crate) struct PortRegistry {
    published: DashMap<u16, PublishedPort>,
    streams: DashMap<u64, Arc<DeviceStream>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            published: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    /// Announces a port, replacing any previous entry for the number.
    pub fn publish(&self, port: PublishedPort) {
        self.published.insert(port.port, port);
    }

    /// Withdraws a port. Returns true when it was published.
    pub fn unpublish(&self, port: u16) -> bool {
        self.published.remove(&port).is_some()
    }

    /// Looks up a published port by number.
    pub fn published(&self, port: u16) -> Option<PublishedPort> {
        self.published.get(&port).map(|entry| entry.clone())
    }

    /// Inserts a stream keyed by its ref. Returns false when the ref is
    /// already present (the uniqueness invariant would break).
    pub fn insert_stream(&self, stream: Arc<DeviceStream>) -> bool {
        match self.streams.entry(stream.stream_ref) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stream);
                true
            }
        }
    }

    /// Looks up a live stream by ref.
    pub fn stream(&self, stream_ref: u64) -> Option<Arc<DeviceStream>> {
        self.streams.get(&stream_ref).map(|entry| entry.clone())
    }

    /// Removes a stream by ref.
    pub fn remove_stream(&self, stream_ref: u64) -> Option<Arc<DeviceStream>> {
        self.streams.remove(&stream_ref).map(|(_, stream)| stream)
    }

    /// Removes and returns every live stream (session teardown).
    pub fn drain_streams(&self) -> Vec<Arc<DeviceStream>> {
        let refs: Vec<u64> = self.streams.iter().map(|entry| *entry.key()).collect();
        refs.into_iter()
            .filter_map(|r| self.remove_stream(r))
            .collect()
    }
}
