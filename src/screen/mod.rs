//! Screen pipeline: capture → encode → publish on one side,
//! receive → decode → present on the other.

pub mod capture;
pub mod receiver;
pub mod viewer;

use std::sync::Arc;

use crate::codec::Frame;
use crate::error::Result;

pub use capture::{DisplaySource, ScreenCapturePublisher};
pub use receiver::ScreenSubscriberRenderer;
pub use viewer::TerminalDisplay;

/// Something that produces full-display frames.
pub trait ScreenSource {
    /// Grab the current display contents. `Ok(None)` means no new frame is
    /// ready yet and the caller should poll again shortly.
    fn capture(&mut self) -> Result<Option<Frame>>;
}

/// Receives decoded frames for presentation. Each frame replaces the last.
pub trait DisplaySink: Send + Sync {
    fn present(&self, frame: Frame);
}

/// Opens a screen source on the capture thread.
pub type OpenScreenSource = Arc<dyn Fn() -> Result<Box<dyn ScreenSource>> + Send + Sync>;
