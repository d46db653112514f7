use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Bytes moved by one worker during one bounded time window. Timestamps are
/// milliseconds since the owning aggregator's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: u64,
    pub window_ms: u64,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Snapshot {
    pub fn speed_mbps(&self) -> f64 {
        if self.window_ms == 0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0 * 1000.0) / self.window_ms as f64 / 1_000_000.0
    }
}

/// Combined bit rate of a set of snapshots: byte sum over duration sum.
/// Durations are additive across workers, so overlapping windows from
/// concurrent connections read as aggregate work rate.
pub fn combined_speed_mbps(snapshots: &[Snapshot]) -> f64 {
    let bytes: u64 = snapshots.iter().map(|s| s.bytes).sum();
    let duration_ms: u64 = snapshots.iter().map(|s| s.window_ms).sum();
    if duration_ms == 0 {
        return 0.0;
    }
    (bytes as f64 * 8.0 * 1000.0) / duration_ms as f64 / 1_000_000.0
}

#[derive(Debug, Default)]
struct Inner {
    snapshots: Vec<Snapshot>,
    total_bytes: u64,
}

/// Append-only sample store shared by every worker of one phase. The single
/// mutex guards both the snapshot list and the running byte total; it is
/// never held across an await.
#[derive(Debug)]
pub struct SnapshotAggregator {
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl SnapshotAggregator {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn record(&self, snapshot: Snapshot) {
        self.lock().snapshots.push(snapshot);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.lock().total_bytes += bytes;
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.lock().snapshots.clone()
    }

    pub fn recent_snapshots(&self, now_ms: u64, window_ms: u64) -> Vec<Snapshot> {
        self.lock()
            .snapshots
            .iter()
            .filter(|s| now_ms.saturating_sub(s.end_ms) < window_ms)
            .copied()
            .collect()
    }

    pub fn windowed_speed(&self, now_ms: u64, window_ms: u64) -> f64 {
        combined_speed_mbps(&self.recent_snapshots(now_ms, window_ms))
    }
}

impl Default for SnapshotAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(bytes: u64, window_ms: u64, end_ms: u64) -> Snapshot {
        Snapshot {
            bytes,
            window_ms,
            start_ms: end_ms.saturating_sub(window_ms),
            end_ms,
        }
    }

    #[test]
    fn zero_duration_yields_zero_speed() {
        let aggregator = SnapshotAggregator::new();
        aggregator.record(snapshot(5000, 0, 100));
        assert_eq!(aggregator.windowed_speed(100, 1000), 0.0);
        assert_eq!(combined_speed_mbps(&[]), 0.0);
    }

    #[test]
    fn speed_is_a_pure_rate() {
        let a = combined_speed_mbps(&[snapshot(1000, 100, 100)]);
        let b = combined_speed_mbps(&[snapshot(5000, 500, 500)]);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn three_overlapping_workers_combine_to_four_mbps() {
        let aggregator = SnapshotAggregator::new();
        for _ in 0..3 {
            aggregator.record(snapshot(100_000, 200, 900));
        }
        let speed = aggregator.windowed_speed(1000, 1000);
        assert!((speed - 4.0).abs() < 1e-9, "got {speed}");
    }

    #[test]
    fn stale_snapshots_fall_out_of_the_window() {
        let aggregator = SnapshotAggregator::new();
        aggregator.record(snapshot(100_000, 200, 500));
        aggregator.record(snapshot(100_000, 200, 4500));
        let recent = aggregator.recent_snapshots(5000, 1000);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].end_ms, 4500);
    }

    #[test]
    fn window_filter_tolerates_clock_skew() {
        // A snapshot stamped just past the reader's `now` still counts.
        let aggregator = SnapshotAggregator::new();
        aggregator.record(snapshot(1000, 200, 1050));
        assert_eq!(aggregator.recent_snapshots(1000, 1000).len(), 1);
    }

    #[test]
    fn byte_total_accumulates_monotonically() {
        let aggregator = SnapshotAggregator::new();
        let mut previous = 0;
        for _ in 0..10 {
            aggregator.add_bytes(8192);
            let total = aggregator.total_bytes();
            assert!(total > previous);
            previous = total;
        }
        assert_eq!(previous, 81_920);
    }

    #[test]
    fn per_snapshot_speed_guards_zero_window() {
        assert_eq!(snapshot(8192, 0, 10).speed_mbps(), 0.0);
        let s = snapshot(125_000, 1000, 1000);
        assert!((s.speed_mbps() - 1.0).abs() < 1e-12);
    }
}
