use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use rand::Rng;
use reqwest::header::RANGE;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::aggregator::{Snapshot, SnapshotAggregator};
use crate::settings::Settings;

/// One concurrent download connection. Streams a randomized byte range and
/// reports a cumulative snapshot whenever its local window fills.
pub struct DownloadWorker {
    id: usize,
    url: String,
    client: reqwest::Client,
    aggregator: Arc<SnapshotAggregator>,
    snapshot_window_ms: u64,
    range_span: u64,
    range_offset_ceiling: u64,
}

impl DownloadWorker {
    pub fn new(
        id: usize,
        client: reqwest::Client,
        aggregator: Arc<SnapshotAggregator>,
        settings: &Settings,
    ) -> Self {
        Self {
            id,
            url: settings.endpoint_for(id).to_string(),
            client,
            aggregator,
            snapshot_window_ms: settings.snapshot_window_ms,
            range_span: settings.range_span,
            range_offset_ceiling: settings.range_offset_ceiling,
        }
    }

    /// A failed connection ends this worker only; the run keeps going and
    /// the scaling monitor spawns a replacement.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        match self.transfer(&mut cancel).await {
            Ok(bytes) => debug!(worker = self.id, bytes, "download stream ended"),
            Err(err) => warn!(worker = self.id, error = %err, "download connection failed"),
        }
    }

    async fn transfer(&self, cancel: &mut watch::Receiver<bool>) -> Result<u64> {
        // Random start offset so repeated fetches of the same file defeat
        // intermediate caches.
        let range_start = if self.range_offset_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.range_offset_ceiling)
        };
        let range_end = range_start + self.range_span;

        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={range_start}-{range_end}"))
            .send()
            .await?
            .error_for_status()?;
        let mut stream = response.bytes_stream();

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
                chunk = stream.next() => {
                    let bytes = match chunk {
                        Some(chunk) => chunk?,
                        None => break,
                    };

                    let len = bytes.len() as u64;
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

        Ok(total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(endpoint: String) -> Settings {
        Settings {
            endpoints: vec![endpoint],
            snapshot_window_ms: 50,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn streamed_bytes_land_in_the_aggregator() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 65_536]))
            .mount(&server)
            .await;

        let aggregator = Arc::new(SnapshotAggregator::new());
        let worker = DownloadWorker::new(
            0,
            reqwest::Client::new(),
            aggregator.clone(),
            &test_settings(server.uri()),
        );

        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await;

        assert_eq!(aggregator.total_bytes(), 65_536);
    }

    #[tokio::test]
    async fn error_status_is_contained() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let aggregator = Arc::new(SnapshotAggregator::new());
        let worker = DownloadWorker::new(
            0,
            reqwest::Client::new(),
            aggregator.clone(),
            &test_settings(server.uri()),
        );

        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await;

        assert_eq!(aggregator.total_bytes(), 0);
    }

    #[tokio::test]
    async fn refused_connection_is_contained() {
        let aggregator = Arc::new(SnapshotAggregator::new());
        let worker = DownloadWorker::new(
            0,
            reqwest::Client::new(),
            aggregator.clone(),
            &test_settings("http://127.0.0.1:9".to_string()),
        );

        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await;

        assert_eq!(aggregator.total_bytes(), 0);
        assert_eq!(aggregator.snapshot_count(), 0);
    }
}
