use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::debug;

use super::aggregator::{Snapshot, SnapshotAggregator};
use crate::settings::Settings;

/// One synthetic upload connection. There is no server round-trip to bound
/// throughput, so each iteration "sends" a fixed random buffer and pays a
/// fixed pacing delay in its place.
pub struct UploadWorker {
    id: usize,
    data: Vec<u8>,
    aggregator: Arc<SnapshotAggregator>,
    snapshot_window_ms: u64,
    write_delay: Duration,
}

impl UploadWorker {
    pub fn new(id: usize, aggregator: Arc<SnapshotAggregator>, settings: &Settings) -> Self {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let data: Vec<u8> = (0..settings.upload_chunk_size).map(|_| rng.gen()).collect();
        Self {
            id,
            data,
            aggregator,
            snapshot_window_ms: settings.snapshot_window_ms,
            write_delay: settings.upload_write_delay,
        }
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        let mut window_start_ms = self.aggregator.elapsed_ms();
        let mut window_bytes: u64 = 0;
        let mut total_bytes: u64 = 0;

        loop {
            if *cancel.borrow() {
                break;
            }

            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.write_delay) => {
                    let len = self.data.len() as u64;
                    total_bytes += len;
                    window_bytes += len;
                    self.aggregator.add_bytes(len);

                    let now_ms = self.aggregator.elapsed_ms();
                    let window_ms = now_ms.saturating_sub(window_start_ms);
                    if window_ms >= self.snapshot_window_ms {
                        self.aggregator.record(Snapshot {
                            bytes: window_bytes,
                            window_ms,
                            start_ms: window_start_ms,
                            end_ms: now_ms,
                        });
                        window_bytes = 0;
                        window_start_ms = now_ms;
                    }
                }
            }
        }

        debug!(worker = self.id, bytes = total_bytes, "upload worker stopped");
    }
}
