/// Result alias that carries the custom [`BeatlineError`] type.
pub type Result<T> = std::result::Result<T, BeatlineError>;

/// Common error type for the core crate.
///
/// Cancellation and cache misses surface as empty results or `None`, never as
/// an error.
#[derive(Debug, thiserror::Error)]
pub enum BeatlineError {
    /// Free-form failure reported by a collaborator (PCM source, sink, CLI).
    #[error("{0}")]
    Message(String),
    /// Configuration or input that the analysis cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Cache or config (de)serialisation failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The FFT backend rejected a buffer.
    #[error("fft: {0}")]
    Fft(String),
    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

impl BeatlineError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<&str> for BeatlineError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatlineError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for BeatlineError {
    fn from(value: realfft::FftError) -> Self {
        Self::Fft(value.to_string())
    }
}

impl From<tokio::task::JoinError> for BeatlineError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Task(value.to_string())
    }
}
