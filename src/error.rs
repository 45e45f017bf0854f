use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Video error: {0}")]
    VideoError(String),

    /// No backend in the preference list could open the source
    #[error("Failed to open source [{source_id}]: {reason}")]
    OpenFailure { source_id: String, reason: String },

    #[error("Read failure: {0}")]
    ReadFailure(String),

    /// A finite source has no more frames before its next seek
    #[error("End of stream")]
    EndOfStream,

    #[error("Unsupported source: {0}")]
    Unsupported(String),

    #[error("JPEG error: {0}")]
    Jpeg(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    /// Whether a read error only means the finite source ran out of frames
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, AppError::EndOfStream)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
