//! Optional client trace hooks.
//!
//! Callers (the fetch front-end, mostly) can attach callbacks that fire at
//! interesting points of a connection's lifecycle. Hooks are best-effort:
//! the session invokes them inline and never blocks on or reacts to them.

use weft_common::types::{DeviceId, DeviceTicket};

/// User-supplied lifecycle callbacks.
#[derive(Default)]
pub struct ClientTrace {
    /// Name resolution finished with the given tickets.
    pub bns_done: Option<Box<dyn Fn(&[DeviceTicket]) + Send + Sync>>,
    /// An overlay stream to `device:port` is established.
    pub got_conn: Option<Box<dyn Fn(&DeviceId, u16) + Send + Sync>>,
    /// The end-to-end handshake to a device is starting.
    pub e2e_handshake_start: Option<Box<dyn Fn(&DeviceId) + Send + Sync>>,
    /// The end-to-end handshake finished; `Some(msg)` on failure.
    pub e2e_handshake_done: Option<Box<dyn Fn(&DeviceId, Option<&str>) + Send + Sync>>,
}

impl ClientTrace {
    pub(crate) fn fire_bns_done(&self, tickets: &[DeviceTicket]) {
        if let Some(hook) = &self.bns_done {
            hook(tickets);
        }
    }

    pub(crate) fn fire_got_conn(&self, device: &DeviceId, port: u16) {
        if let Some(hook) = &self.got_conn {
            hook(device, port);
        }
    }

    pub(crate) fn fire_e2e_start(&self, device: &DeviceId) {
        if let Some(hook) = &self.e2e_handshake_start {
            hook(device);
        }
    }

    pub(crate) fn fire_e2e_done(&self, device: &DeviceId, error: Option<&str>) {
        if let Some(hook) = &self.e2e_handshake_done {
            hook(device, error);
        }
    }
}
