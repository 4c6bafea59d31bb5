//! Reference-clock arithmetic shared by the gateway and participants.
//!
//! All positions travel with a timestamp in the gateway's clock frame.
//! Participants estimate `offset` such that `local_now + offset` lands in
//! that frame, then hold the estimate for the connection lifetime.

/// Number of round trips collected before the offset is fixed.
pub const SAMPLE_ROUNDS: usize = 10;

pub fn timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One completed clock-sync round trip.
///
/// `t0` is the local send time, `t1` the reference time reported by the
/// gateway, `t2` the local receive time, all in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetSample {
    pub offset_ms: f64,
    pub latency_ms: f64,
}

impl OffsetSample {
    pub fn from_round_trip(t0: u64, t1: u64, t2: u64) -> Self {
        let latency_ms = t2.saturating_sub(t0) as f64 / 2.0;
        let offset_ms = t1 as f64 - (t0 as f64 + latency_ms);
        Self {
            offset_ms,
            latency_ms,
        }
    }
}

/// Accumulates round-trip samples and reduces them to a single offset.
///
/// Failed round trips are simply never recorded; the estimate is the median
/// of whatever samples survived. With nothing recorded the estimate is zero,
/// which degrades to uncorrected local time instead of refusing to play.
#[derive(Debug, Default)]
pub struct OffsetEstimator {
    samples: Vec<OffsetSample>,
}

impl OffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: OffsetSample) {
        self.samples.push(sample);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Median offset in milliseconds (upper median for even counts), 0.0
    /// when no round trip succeeded.
    pub fn estimate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mut offsets: Vec<f64> = self.samples.iter().map(|s| s.offset_ms).collect();
        offsets.sort_by(f64::total_cmp);
        offsets[offsets.len() / 2]
    }
}
