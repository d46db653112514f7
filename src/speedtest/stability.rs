use super::aggregator::Snapshot;

/// Decides whether recent throughput has converged enough to end the phase
/// early: the last `samples` snapshots must all sit within `threshold_pct`
/// of their mean.
#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    samples: usize,
    threshold_pct: f64,
}

impl StabilityDetector {
    pub fn new(samples: usize, threshold_pct: f64) -> Self {
        Self {
            samples,
            threshold_pct,
        }
    }

    pub fn is_stable(&self, snapshots: &[Snapshot]) -> bool {
        if snapshots.len() < self.samples {
            return false;
        }

        let speeds: Vec<f64> = snapshots[snapshots.len() - self.samples..]
            .iter()
            .map(Snapshot::speed_mbps)
            .collect();

        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        // A zero mean leaves relative deviation undefined; an idle link is
        // never considered converged.
        if mean <= 0.0 {
            return false;
        }

        let max_deviation_pct = speeds
            .iter()
            .map(|speed| (speed - mean).abs() / mean * 100.0)
            .fold(0.0, f64::max);

        max_deviation_pct < self.threshold_pct
    }
}
