// ABOUTME: Error types for the event stream decoder and client
// ABOUTME: Frame-level failures are logged and skipped, stream-level failures end the stream

use thiserror::Error;

/// Failure to turn one frame into an event; never stalls the stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The bytes between the tags were not a valid event envelope
    #[error("Malformed frame ({len} bytes): {reason}")]
    Malformed { len: usize, reason: String },

    #[error("Frame exceeded {limit} bytes without an end tag")]
    TooLarge { limit: usize },

    /// The stream ended inside a frame
    #[error("Stream ended inside a frame after {len} bytes")]
    Truncated { len: usize },
}

#[derive(Error, Debug)]
pub enum EventStreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Agent API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EventStreamError>;
