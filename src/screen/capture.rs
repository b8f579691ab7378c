//! Screen capture publisher.
//!
//! Captures the primary display as fast as the platform hands out frames,
//! JPEG-compresses each one and publishes it on the video channel. There is no
//! frame-rate cap: pacing comes from capture and encode cost alone.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scrap::{Capturer, Display};
use tracing::{debug, info, warn};

use super::{OpenScreenSource, ScreenSource};
use crate::codec::{Frame, FrameCodec, PixelFormat};
use crate::error::{Result, StreamError};
use crate::transport::Publisher;
use crate::worker::Worker;

/// Poll interval while the platform has no new frame for us.
const FRAME_POLL: Duration = Duration::from_millis(5);
/// Back-off after a failed capture.
const CAPTURE_RETRY: Duration = Duration::from_millis(50);

/// The primary display, read through `scrap`.
pub struct DisplaySource {
    capturer: Capturer,
    height: usize,
    sampling: Sampling,
}

impl DisplaySource {
    /// Open the primary display, optionally downscaling wide captures to `max_width`.
    pub fn open_primary(max_width: Option<u32>) -> Result<Self> {
        let display = Display::primary()
            .map_err(|e| StreamError::DeviceUnavailable(format!("no display found: {e}")))?;
        let (width, height) = (display.width(), display.height());
        let capturer = Capturer::new(display)
            .map_err(|e| StreamError::DeviceUnavailable(format!("screen capture unavailable: {e}")))?;

        let sampling = Sampling::new(width, height, max_width);
        info!(
            "capturing {width}x{height} display, sending {}x{}",
            sampling.width, sampling.height
        );
        Ok(Self {
            capturer,
            height,
            sampling,
        })
    }
}

impl ScreenSource for DisplaySource {
    fn capture(&mut self) -> Result<Option<Frame>> {
        match self.capturer.frame() {
            Ok(bgra) => {
                // Rows may carry padding beyond width * 4.
                let stride = bgra.len() / self.height.max(1);
                self.sampling.frame_from_bgra(&bgra, stride).map(Some)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(StreamError::Io(e)),
        }
    }
}

/// Keeps `max_width` as an upper bound and preserves the aspect ratio.
pub fn scaled_dimensions(width: u32, height: u32, max_width: Option<u32>) -> (u32, u32) {
    match max_width {
        Some(max) if max > 0 && width > max => {
            let scale = max as f64 / width as f64;
            (max, ((height as f64 * scale) as u32).max(1))
        }
        _ => (width, height),
    }
}

/// Which source pixel feeds each output pixel.
///
/// The display geometry is fixed for the life of a capturer, so the
/// nearest-neighbour lookups are worked out once and reused for every frame.
#[derive(Debug, Clone)]
struct Sampling {
    width: u32,
    height: u32,
    /// Source row index for each output row.
    rows: Vec<usize>,
    /// Byte offset within a source row for each output column.
    columns: Vec<usize>,
}

impl Sampling {
    fn new(src_width: usize, src_height: usize, max_width: Option<u32>) -> Self {
        let (width, height) = scaled_dimensions(src_width as u32, src_height as u32, max_width);
        let rows = (0..height as usize)
            .map(|y| y * src_height / height as usize)
            .collect();
        let columns = (0..width as usize)
            .map(|x| x * src_width / width as usize * 4)
            .collect();
        Self {
            width,
            height,
            rows,
            columns,
        }
    }

    /// Packed RGB frame from a BGRA capture with `stride` bytes per row.
    /// Pixels missing from a short buffer come out black.
    fn frame_from_bgra(&self, bgra: &[u8], stride: usize) -> Result<Frame> {
        let mut rgb = Vec::with_capacity(self.rows.len() * self.columns.len() * 3);
        for &row in &self.rows {
            let line = bgra.get(row * stride..).unwrap_or_default();
            rgb.extend(self.columns.iter().flat_map(|&col| match line.get(col..col + 3) {
                Some(&[b, g, r]) => [r, g, b],
                _ => [0, 0, 0],
            }));
        }
        Frame::new(self.width, self.height, PixelFormat::Rgb, rgb)
    }
}

/// Capture → encode → publish loop on its own thread.
pub struct ScreenCapturePublisher {
    worker: Worker,
}

impl ScreenCapturePublisher {
    /// Open the source on a fresh thread and start publishing.
    ///
    /// Fails without starting anything if the source cannot be opened.
    pub fn start(
        open: OpenScreenSource,
        codec: FrameCodec,
        grayscale: bool,
        publisher: Arc<Publisher>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let worker = Worker::spawn(
            "screen-capture",
            move || open(),
            move |source| capture_loop(source, codec, grayscale, &publisher, &running),
        )?;
        Ok(Self { worker })
    }

    /// Wait for the loop to notice the cleared running flag.
    pub fn join(self) {
        self.worker.join();
    }
}

fn capture_loop(
    mut source: Box<dyn ScreenSource>,
    codec: FrameCodec,
    grayscale: bool,
    publisher: &Publisher,
    running: &AtomicBool,
) {
    let mut sent: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let frame = match source.capture() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                std::thread::sleep(FRAME_POLL);
                continue;
            }
            Err(e) => {
                warn!("screen capture failed: {e}");
                std::thread::sleep(CAPTURE_RETRY);
                continue;
            }
        };

        match codec.encode(&frame, grayscale) {
            Ok(jpeg) => {
                debug!(seq = sent, bytes = jpeg.len(), "sent frame");
                publisher.publish(jpeg);
                sent += 1;
            }
            Err(e) => warn!("skipping frame: {e}"),
        }
    }

    info!("screen capture stopped after {sent} frames");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_is_reordered() {
        // 2x1 image: blue pixel then red pixel.
        let bgra = [255, 0, 0, 255, 0, 0, 255, 255];
        let frame = Sampling::new(2, 1, None).frame_from_bgra(&bgra, 8).unwrap();
        assert_eq!(frame.pixels, vec![0, 0, 255, 255, 0, 0]);
    }

    #[test]
    fn stride_padding_is_skipped() {
        // 1x2 image with 4 bytes of padding per row.
        let bgra = [10, 20, 30, 255, 9, 9, 9, 9, 40, 50, 60, 255, 9, 9, 9, 9];
        let frame = Sampling::new(1, 2, None).frame_from_bgra(&bgra, 8).unwrap();
        assert_eq!(frame.pixels, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn downscale_keeps_aspect_ratio() {
        assert_eq!(scaled_dimensions(3840, 2160, Some(1920)), (1920, 1080));
        assert_eq!(scaled_dimensions(1280, 720, Some(1920)), (1280, 720));
        assert_eq!(scaled_dimensions(1280, 720, None), (1280, 720));
    }

    #[test]
    fn downscale_samples_every_other_pixel() {
        // 4x2 source, each pixel's blue channel holds its column index.
        let bgra: Vec<u8> = (0..2).flat_map(|_| (0..4u8).flat_map(|x| [x, 0, 0, 255])).collect();
        let sampling = Sampling::new(4, 2, Some(2));
        let frame = sampling.frame_from_bgra(&bgra, 16).unwrap();
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(frame.pixels, vec![0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn truncated_capture_is_padded_black() {
        let bgra = [1, 2, 3, 255];
        let frame = Sampling::new(2, 2, None).frame_from_bgra(&bgra, 8).unwrap();
        assert_eq!(frame.pixels.len(), 2 * 2 * 3);
        assert_eq!(&frame.pixels[..3], &[3, 2, 1]);
        assert!(frame.pixels[3..].iter().all(|&v| v == 0));
    }
}
