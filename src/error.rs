//! Typed stream errors.
//!
//! Lower layers raise these inside `anyhow::Error`; the pipeline driver classifies
//! them with [`StreamError::classify`] to decide between ending the stream session,
//! aborting a single recording segment, or propagating.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Malformed or missing MJPEG headers, boundary, or part length.
    #[error("mjpeg protocol error: {0}")]
    Protocol(String),
    /// No bytes arrived within the configured socket timeout.
    #[error("stream read timed out")]
    Timeout,
    /// End of stream or camera disconnect.
    #[error("stream source exhausted")]
    SourceExhausted,
    /// Output directory or sink could not be created or written.
    #[error("recording error: {0}")]
    Recording(String),
}

impl StreamError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn recording(msg: impl Into<String>) -> Self {
        Self::Recording(msg.into())
    }

    /// Find a `StreamError` anywhere in an `anyhow` chain.
    pub fn classify(err: &anyhow::Error) -> Option<&StreamError> {
        err.downcast_ref::<StreamError>()
            .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<StreamError>()))
    }

    /// True for errors that end the current stream session without failing the process.
    pub fn ends_stream(&self) -> bool {
        matches!(
            self,
            StreamError::Protocol(_) | StreamError::Timeout | StreamError::SourceExhausted
        )
    }
}
