//! Presentation timestamp derivation for encoded output.
//!
//! Timestamps come from wall-clock time elapsed since the current segment
//! began, never from a frame counter, so output duration stays accurate when
//! the camera jitters or drops frames. [`PtsGuard`] then enforces strictly
//! increasing values within a segment.

use std::time::Instant;

/// Number of consecutive backward jumps logged individually before going quiet.
const MAX_LOGGED_ANOMALIES: u64 = 5;

/// Wall-clock origin of the current segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentClock {
    started_at: Instant,
}

impl SegmentClock {
    pub fn start_now() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    /// Reset the origin to now (called at segment start).
    pub fn restart(&mut self) {
        self.started_at = Instant::now();
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed_us(&self) -> i64 {
        self.elapsed_us_at(Instant::now())
    }

    pub fn elapsed_us_at(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.started_at).as_micros() as i64
    }
}

/// Keeps presentation timestamps strictly increasing within one segment.
///
/// A value at or below the previous one is replaced by previous + 1us and
/// counted as an anomaly.
#[derive(Debug)]
pub struct PtsGuard {
    stream_name: String,
    last_us: Option<i64>,
    anomaly_count: u64,
    total_compensation_us: i64,
}

impl PtsGuard {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            last_us: None,
            anomaly_count: 0,
            total_compensation_us: 0,
        }
    }

    /// Return the timestamp to write for a raw wall-clock value.
    pub fn process(&mut self, raw_us: i64) -> i64 {
        let raw_us = raw_us.max(0);
        let Some(last) = self.last_us else {
            self.last_us = Some(raw_us);
            return raw_us;
        };

        if raw_us <= last {
            let compensated = last + 1;
            self.anomaly_count += 1;
            self.total_compensation_us += compensated - raw_us;
            if self.anomaly_count <= MAX_LOGGED_ANOMALIES {
                log::debug!(
                    "[{}] Non-increasing pts {}us after {}us, using {}us",
                    self.stream_name,
                    raw_us,
                    last,
                    compensated
                );
            }
            self.last_us = Some(compensated);
            return compensated;
        }

        self.last_us = Some(raw_us);
        raw_us
    }

    /// Forget the previous timestamp (new segment).
    pub fn reset(&mut self) {
        if self.anomaly_count > 0 {
            log::info!("{}", self.summary());
        }
        self.last_us = None;
        self.anomaly_count = 0;
        self.total_compensation_us = 0;
    }

    pub fn last_us(&self) -> Option<i64> {
        self.last_us
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_count
    }

    pub fn summary(&self) -> String {
        format!(
            "[{}] pts anomalies={} compensation={}us",
            self.stream_name, self.anomaly_count, self.total_compensation_us
        )
    }
}
