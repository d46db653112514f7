pub mod aggregator;
pub mod download;
pub mod latency;
pub mod orchestrator;
pub mod stability;
pub mod upload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Idle,
    Latency,
    Download,
    Upload,
    Complete,
    Error,
}

/// One reading of the engine, emitted on every progress tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub speed_mbps: f64,
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
}

/// Final totals of a download or upload phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseResult {
    pub speed_mbps: f64,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
}
