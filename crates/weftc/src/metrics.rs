//! Client-side metrics helpers.
//!
//! Thin wrappers over the `metrics` facade. Recording is gated by the
//! `metrics.enabled` config at the call sites; with no recorder installed
//! the macros are no-ops anyway, so disabled metrics cost nothing.

/// Byte and frame counters.
pub mod counters {
    /// Record wire bytes moved in the given direction ("in"/"out").
    pub fn wire_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("weft_wire_bytes_total", "direction" => direction).increment(bytes);
    }

    /// Increment the replayed-calls counter after a reconnect.
    pub fn calls_replayed_total(count: u64) {
        metrics::counter!("weft_calls_replayed_total").increment(count);
    }

    /// Increment the reconnects counter.
    pub fn reconnects_total() {
        metrics::counter!("weft_reconnects_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a frame write duration in seconds.
    pub fn write_seconds(value: f64) {
        metrics::histogram!("weft_write_seconds").record(value);
    }

    /// Record a call round-trip duration in seconds.
    pub fn round_trip_seconds(value: f64) {
        metrics::histogram!("weft_round_trip_seconds").record(value);
    }
}
