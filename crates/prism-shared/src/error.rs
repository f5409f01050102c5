//! Error types for Prism.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrismError {
    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("Reasoning transport error: {0}")]
    Transport(String),

    #[error("Reasoning response parse error: {0}")]
    Parse(String),

    #[error("Request queue is closed")]
    QueueClosed,

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Cache persistence error: {0}")]
    Persistence(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PrismError::UnknownMode("nonexistent".to_string());
        assert_eq!(err.to_string(), "Unknown mode: nonexistent");
        assert_eq!(
            PrismError::Timeout(30).to_string(),
            "Request timed out after 30 seconds"
        );
    }
}
