use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Open failed: {0}")]
    Open(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Report output failed: {0}")]
    Report(String),

    #[error("Verification failed on {failed_steps} step(s)")]
    Verification { failed_steps: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] serde_json::Error),
}

impl BenchError {
    /// True for errors the user fixes by changing the command line or input files.
    pub fn is_config(&self) -> bool {
        matches!(self, BenchError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
