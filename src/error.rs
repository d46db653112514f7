use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeedTestError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("another phase is already running")]
    PhaseActive,

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
