//! Error types shared by the transport, codec and pipeline loops.
//!
//! Loops classify every failure into one of three buckets: the channel was
//! closed on purpose (exit quietly), a transient glitch (log and keep going),
//! or a device that could not be opened (abort the role and tell the operator).

use thiserror::Error;

/// Why an encoded frame could not be turned back into pixels.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is below the minimal header length; the image decoder was never run.
    #[error("payload too short to be an image: {len} bytes")]
    TooShort { len: usize },

    /// The image decoder rejected the payload.
    #[error("malformed image payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    /// The channel was torn down deliberately. Not a failure.
    #[error("channel closed")]
    ChannelClosed,

    /// Any publish/receive failure other than explicit closure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode failed: {0}")]
    Encode(String),

    /// Pixel buffer length does not match its declared geometry.
    #[error("invalid frame: {width}x{height} needs {expected} bytes, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// Host/port pair that cannot carry both streams.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A capture or playback device could not be opened. Fatal for the role.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::ChannelClosed)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::Transport(e.to_string())
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
