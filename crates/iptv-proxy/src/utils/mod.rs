//! Small shared helpers: request-id log correlation and transfer speed
//! reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Short monotonic request id, prefixed to stream lifecycle log lines so the
/// attempts of one client request can be correlated.
pub fn rid() -> String {
    let c = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) % 100_000;
    format!("{c:05}| ")
}

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Relay throughput meter. Logs per-second progress while a stream is
/// flowing and a summary on finish, both at debug level.
pub struct SpeedMeter {
    rid: String,
    started: Instant,
    bytes: u64,
    part_started: Instant,
    part_bytes: u64,
}

impl SpeedMeter {
    pub fn new(rid: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            rid: rid.into(),
            started: now,
            bytes: 0,
            part_started: now,
            part_bytes: 0,
        }
    }

    pub fn processed(&mut self, len: u64) {
        if self.bytes == 0 {
            debug!("{}start", self.rid);
        }

        self.bytes += len;
        self.part_bytes += len;

        if self.part_started.elapsed().as_millis() > 1000 {
            self.log_part();
        }
    }

    pub fn finish(mut self) {
        if self.part_started.elapsed().as_millis() > 1000 {
            self.log_part();
        }

        let elapsed_ms = self.started.elapsed().as_millis().max(1) as u64;
        debug!(
            "{}finished: {}, speed: {}/s, {}ms",
            self.rid,
            format_bytes(self.bytes),
            format_bytes(self.bytes * 1000 / elapsed_ms),
            elapsed_ms
        );
    }

    fn log_part(&mut self) {
        let delta_ms = self.part_started.elapsed().as_millis().max(1) as u64;
        debug!(
            "{}progress: {} speed: {}/s",
            self.rid,
            format_bytes(self.part_bytes),
            format_bytes(self.part_bytes * 1000 / delta_ms)
        );
        self.part_started = Instant::now();
        self.part_bytes = 0;
    }
}

fn format_bytes(value: u64) -> String {
    if value < KB {
        format!("{value}b")
    } else if value < MB {
        format!("{:.2}Kb", value as f64 / KB as f64)
    } else {
        format!("{:.2}Mb", value as f64 / MB as f64)
    }
}
