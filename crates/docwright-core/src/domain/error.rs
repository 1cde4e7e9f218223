//! Domain-level error taxonomy for docwright.

/// docwright domain errors: identifiers, payloads, configuration.
#[derive(Debug, thiserror::Error)]
pub enum DocwrightError {
    #[error("invalid commit id: {0:?}")]
    InvalidCommitId(String),

    #[error("invalid push payload: {0}")]
    Payload(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for docwright domain operations.
pub type Result<T> = std::result::Result<T, DocwrightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docwright_error_display() {
        let err = DocwrightError::InvalidCommitId("xyz".to_string());
        assert!(err.to_string().contains("invalid commit id"));

        let err = DocwrightError::Payload("missing commits".to_string());
        assert!(err.to_string().contains("missing commits"));

        let err = DocwrightError::Config("repository must be owner/name".to_string());
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
