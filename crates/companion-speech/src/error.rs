use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpeechError>;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("rate limited by backend")]
    RateLimited,

    #[error("text rejected as too long by backend")]
    TooLong,

    #[error("failed to decode audio payload: {0}")]
    Decode(String),

    #[error("playback timed out after {0} ms")]
    Timeout(u64),

    #[error("audio output error: {0}")]
    Output(String),
}

impl SpeechError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            SpeechError::RateLimited => true,
            SpeechError::Http(e) => e.status().map(|s| s.as_u16() == 429).unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_too_long(&self) -> bool {
        matches!(self, SpeechError::TooLong)
    }
}
