//! Error types for saliency generation.

/// Errors that can occur while generating attributions.
#[derive(Debug, thiserror::Error)]
pub enum SaliencyError {
    /// Invalid or inconsistent run configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Missing checkpoint files or weights that do not fit the model.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Attribution strategy applied to inputs it cannot handle.
    #[error("attribution error: {0}")]
    Attribution(String),

    /// Tokenizer construction or vocabulary lookup error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed or unreadable evaluation data.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Tensor operation error (wraps tch).
    #[error("tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    /// CSV parsing error.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for saliency operations.
pub type Result<T> = std::result::Result<T, SaliencyError>;
