use std::cmp::Ordering;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::debug;

use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyMeasurement {
    pub latency_ms: f64,
    pub timestamp_ms: u64,
}

/// Round-trip probing against the endpoint pool. Probes that fail or time
/// out are dropped; the result is the median of whatever succeeded, or 0.0
/// when nothing did.
pub struct LatencyTest {
    endpoints: Vec<String>,
    probe_count: usize,
    probe_delay: Duration,
}

impl LatencyTest {
    pub fn new(settings: &Settings) -> Self {
        Self {
            endpoints: settings.endpoints.clone(),
            probe_count: settings.probe_count,
            probe_delay: settings.probe_delay,
        }
    }

    pub async fn run(&self, client: &reqwest::Client, cancel: watch::Receiver<bool>) -> f64 {
        let epoch = Instant::now();
        let mut measurements: Vec<LatencyMeasurement> = Vec::new();

        for _ in 0..self.probe_count {
            if *cancel.borrow() {
                break;
            }

            let url = {
                let mut rng = rand::thread_rng();
                match self.endpoints.choose(&mut rng) {
                    Some(endpoint) => endpoint.clone(),
                    None => break,
                }
            };

            let started = Instant::now();
            match client.head(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    measurements.push(LatencyMeasurement {
                        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                        timestamp_ms: epoch.elapsed().as_millis() as u64,
                    });
                }
                Ok(response) => {
                    debug!(%url, status = %response.status(), "latency probe rejected");
                }
                Err(err) => {
                    debug!(%url, error = %err, "latency probe failed");
                }
            }

            tokio::time::sleep(self.probe_delay).await;
        }

        median_ms(measurements.iter().map(|m| m.latency_ms).collect())
    }
}

// Upper-median: index count / 2 after an ascending sort, so an even sample
// count reports the higher middle value rather than averaging the two.
fn median_ms(mut samples: Vec<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    samples[samples.len() / 2]
}
