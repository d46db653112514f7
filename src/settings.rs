use std::time::Duration;

use crate::error::SpeedTestError;

#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoints: Vec<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    pub upload_connections: usize,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub upload_duration: Duration,
    pub progress_interval: Duration,
    pub monitor_interval: Duration,
    pub probe_count: usize,
    pub probe_timeout: Duration,
    pub probe_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub snapshot_window_ms: u64,
    pub aggregation_window_ms: u64,
    pub stability_samples: usize,
    pub stability_threshold_pct: f64,
    pub range_span: u64,
    pub range_offset_ceiling: u64,
    pub upload_chunk_size: usize,
    pub upload_write_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "http://speedtest.ftp.otenet.gr/files/test100Mb.db".to_string(),
                "http://speedtest.tele2.net/100MB.zip".to_string(),
                "http://ipv4.download.thinkbroadband.com/100MB.zip".to_string(),
            ],
            min_connections: 1,
            max_connections: 8,
            upload_connections: 3,
            min_duration: Duration::from_secs(5),
            max_duration: Duration::from_secs(30),
            upload_duration: Duration::from_secs(10),
            progress_interval: Duration::from_millis(150),
            monitor_interval: Duration::from_secs(1),
            probe_count: 5,
            probe_timeout: Duration::from_secs(5),
            probe_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            snapshot_window_ms: 200,
            aggregation_window_ms: 1000,
            stability_samples: 10,
            stability_threshold_pct: 5.0,
            range_span: 10_000_000,
            range_offset_ceiling: 10_000_000,
            upload_chunk_size: 8192,
            upload_write_delay: Duration::from_millis(10),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SpeedTestError> {
        if self.endpoints.is_empty() {
            return Err(SpeedTestError::InvalidSettings(
                "endpoint pool is empty".to_string(),
            ));
        }
        if self.min_connections == 0 {
            return Err(SpeedTestError::InvalidSettings(
                "min_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(SpeedTestError::InvalidSettings(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.progress_interval.is_zero() {
            return Err(SpeedTestError::InvalidSettings(
                "progress_interval must be non-zero".to_string(),
            ));
        }
        if self.stability_samples == 0 {
            return Err(SpeedTestError::InvalidSettings(
                "stability_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint_for(&self, worker_id: usize) -> &str {
        &self.endpoints[worker_id % self.endpoints.len()]
    }
}
