//! Best-effort desktop screen and audio streaming.
//!
//! A publisher captures the display and microphone and broadcasts each
//! encoded frame and raw PCM chunk over a lossy publish/subscribe transport.
//! Subscribers decode and present whatever reaches them.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod screen;
pub mod session;
pub mod transport;

mod worker;

pub use error::{DecodeError, Result, StreamError};
