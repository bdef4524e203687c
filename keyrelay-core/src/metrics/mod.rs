//! Metrics for the decryption engine
//!
//! Recording is a no-op until the host installs a `metrics` recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const TICKS_TOTAL: &str = "decryption.ticks.total";
pub const TICKS_FAILED: &str = "decryption.ticks.failed";
pub const TICK_DURATION_MS: &str = "decryption.tick.duration_ms";
pub const EVENTS_DECRYPTED: &str = "decryption.events.decrypted";
pub const EVENTS_FAILED: &str = "decryption.events.failed";
pub const SESSIONS_IMPORTED: &str = "decryption.sessions.imported";
pub const KEY_SOLICITATIONS_SENT: &str = "decryption.key_solicitations.sent";
pub const KEY_FULFILLMENTS_SENT: &str = "decryption.key_fulfillments.sent";

/// Register metric descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(TICKS_TOTAL, "Number of scheduler ticks that ran a work item");
    describe_counter!(TICKS_FAILED, "Number of ticks whose work item returned an error");
    describe_histogram!(TICK_DURATION_MS, "Tick duration in milliseconds");
    describe_counter!(EVENTS_DECRYPTED, "Number of events decrypted");
    describe_counter!(EVENTS_FAILED, "Number of failed decryption attempts");
    describe_counter!(SESSIONS_IMPORTED, "Number of group sessions imported");
    describe_counter!(KEY_SOLICITATIONS_SENT, "Number of key solicitations sent");
    describe_counter!(KEY_FULFILLMENTS_SENT, "Number of key fulfillments sent");
}

pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Records elapsed milliseconds into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn start(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    pub fn stop(self) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        record_histogram(self.name, elapsed_ms);
        elapsed_ms
    }
}
