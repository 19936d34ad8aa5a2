use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChromaError {
    #[error("Strategy selection failed: {0}")]
    StrategySelection(String),

    #[error("Strategy '{strategy}' failed: {message}")]
    StrategyExecution { strategy: String, message: String },

    #[error("Perceptual coordination failed: {0}")]
    PerceptualCoordination(String),

    #[error("No successful strategies: {0}")]
    NoSuccessfulStrategies(String),

    #[error("Processing timed out after {0}ms")]
    ProcessingTimeout(u64),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Invalid color: {0}")]
    InvalidColor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChromaError {
    pub fn strategy(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        ChromaError::StrategyExecution {
            strategy: strategy.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChromaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_io_error_keeps_source() {
        let err: ChromaError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json").into();
        assert!(matches!(err, ChromaError::Io(_)));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn test_serde_error_converts() {
        let err: ChromaError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, ChromaError::Serialization(_)));
    }
}
