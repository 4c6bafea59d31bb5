//! Drift correction against relayed host position reports.
//!
//! Every accepted report is projected to "where the host is right now" and
//! compared with the local player. Large gaps get one hard seek; small ones
//! are closed by nudging the playback rate so the audio never pops.

use common_sync::metrics::playback_metrics;
use tracing::debug;

use crate::media::{MediaError, MediaPlayer};

/// Above this gap a rate nudge would take too long; seek instead.
pub const HARD_SYNC_THRESHOLD_SECS: f64 = 2.0;
/// Below this gap playback is considered in sync.
pub const SOFT_SYNC_THRESHOLD_SECS: f64 = 0.05;
/// Hard seeks land slightly ahead to cover the time the seek itself takes.
pub const SEEK_LEAD_SECS: f64 = 0.1;
pub const CATCH_UP_RATE: f64 = 1.05;
pub const SLOW_DOWN_RATE: f64 = 0.95;

/// One host position report in the shared reference frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    pub position_secs: f64,
    pub reference_now_ms: u64,
    pub sequence: u64,
}

/// What [`DriftCorrector::apply`] did to the player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Report was at or below the last applied sequence and was dropped.
    Stale,
    Seek { to: f64 },
    Rate { to: f64 },
    Unchanged,
}

/// Hysteretic three-band corrector. Keeps the last applied sequence so
/// reordered reports can never rewind playback, and the applied rate so a
/// nudge is only sent to the player when it actually changes.
pub struct DriftCorrector {
    last_applied: Option<u64>,
    applied_rate: f64,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self {
            last_applied: None,
            applied_rate: 1.0,
        }
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Compares the projected host position with the local player and
    /// corrects within the band the drift falls in.
    pub fn apply(
        &mut self,
        point: &SyncPoint,
        playing: bool,
        now_ms: u64,
        offset_ms: f64,
        player: &mut dyn MediaPlayer,
    ) -> Result<Correction, MediaError> {
        if let Some(last) = self.last_applied {
            if point.sequence <= last {
                playback_metrics().inc_stale_snapshots();
                debug!(
                    sequence = point.sequence,
                    last_applied = last,
                    "dropped out-of-order position report"
                );
                return Ok(Correction::Stale);
            }
        }
        self.last_applied = Some(point.sequence);

        let expected = expected_position(point, playing, now_ms, offset_ms);
        let actual = player.position_secs()?;
        let drift = expected - actual;
        playback_metrics().observe_drift_seconds(drift.abs());

        if drift.abs() > HARD_SYNC_THRESHOLD_SECS {
            let to = expected + SEEK_LEAD_SECS;
            player.seek(to)?;
            player.set_rate(1.0)?;
            self.applied_rate = 1.0;
            playback_metrics().inc_hard_corrections();
            return Ok(Correction::Seek { to });
        }

        if drift.abs() > SOFT_SYNC_THRESHOLD_SECS {
            let target = if drift > 0.0 {
                CATCH_UP_RATE
            } else {
                SLOW_DOWN_RATE
            };
            if self.applied_rate == target {
                return Ok(Correction::Unchanged);
            }
            player.set_rate(target)?;
            self.applied_rate = target;
            playback_metrics().inc_rate_nudges();
            return Ok(Correction::Rate { to: target });
        }

        if self.applied_rate != 1.0 {
            player.set_rate(1.0)?;
            self.applied_rate = 1.0;
            playback_metrics().inc_rate_nudges();
            return Ok(Correction::Rate { to: 1.0 });
        }

        Ok(Correction::Unchanged)
    }

    /// Late-join catch-up: seek straight to the projected position, no
    /// band checks and no seek lead. Runs once, when the player is ready.
    pub fn catch_up(
        &mut self,
        snapshot: &SyncPoint,
        playing: bool,
        now_ms: u64,
        offset_ms: f64,
        player: &mut dyn MediaPlayer,
    ) -> Result<f64, MediaError> {
        let target = expected_position(snapshot, playing, now_ms, offset_ms);
        player.seek(target)?;
        self.last_applied = Some(snapshot.sequence);
        Ok(target)
    }

    /// Marks everything at or below `sequence` as already covered without
    /// touching the player. Used when a snapshot carries no media to drive
    /// but still outranks in-flight relays.
    pub fn set_floor(&mut self, sequence: u64) {
        let floor = match self.last_applied {
            Some(last) => last.max(sequence),
            None => sequence,
        };
        self.last_applied = Some(floor);
    }
}

impl Default for DriftCorrector {
    fn default() -> Self {
        Self::new()
    }
}

/// Projects where the host is now. While paused the report is taken as-is;
/// while playing the time since the host stamped it is added, clamped so a
/// reference stamp from the future cannot rewind the projection.
fn expected_position(point: &SyncPoint, playing: bool, now_ms: u64, offset_ms: f64) -> f64 {
    if !playing {
        return point.position_secs;
    }
    let reference_now = now_ms as f64 + offset_ms;
    let elapsed_secs = ((reference_now - point.reference_now_ms as f64) / 1000.0).max(0.0);
    point.position_secs + elapsed_secs
}
