//! Adaptive multi-connection speed test engine: latency probing, concurrent
//! download/upload workers over a sliding-window throughput aggregator, a
//! connection auto-scaler, and a stability detector that decides when a
//! measurement has converged. Presentation, settings persistence, and result
//! formatting belong to the consuming application.

pub mod error;
pub mod settings;
pub mod speedtest;

pub use error::SpeedTestError;
pub use settings::Settings;
pub use speedtest::aggregator::{Snapshot, SnapshotAggregator};
pub use speedtest::latency::LatencyMeasurement;
pub use speedtest::orchestrator::SpeedTest;
pub use speedtest::stability::StabilityDetector;
pub use speedtest::{PhaseResult, ProgressEvent, TestPhase};
