use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Aggregate transfer figures of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Whole percent, 0..=100.
    pub progress: u8,
    /// Bytes per millisecond, `None` when unknown.
    pub speed: Option<u64>,
    /// Seconds, `None` when unknown.
    pub time_remaining: Option<u64>,
}

/// File progress in whole percent from per-chunk fractions.
///
/// Every chunk counts, including ones completed before this run.
pub fn file_progress(chunk_progress: &[f64]) -> u8 {
    if chunk_progress.is_empty() {
        return 0;
    }
    let mean = chunk_progress.iter().sum::<f64>() / chunk_progress.len() as f64;
    (mean * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Mean speed of the chunks currently uploading, in bytes per millisecond.
///
/// Returns `None` when no chunk reports a speed.
pub fn file_speed(speeds: &[f64]) -> Option<u64> {
    if speeds.is_empty() {
        return None;
    }
    let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
    if !mean.is_finite() {
        return None;
    }
    Some(mean.round() as u64)
}

/// Estimated seconds left to send `remaining_bytes`.
///
/// Returns `None` if speed is unknown or zero.
pub fn time_remaining(remaining_bytes: f64, speed: Option<u64>) -> Option<u64> {
    let speed = speed.filter(|s| *s > 0)? as f64;
    let secs = (remaining_bytes.max(0.0) / speed / 1000.0).round();
    Some(secs as u64)
}

/// Rate limiter for progress notifications.
///
/// The first call always passes; later calls pass once `interval` has
/// elapsed since the last one that passed.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns `true` if a notification should be emitted now.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forces the next call to [`ready`](Self::ready) to pass.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
