//! Frame model and the lossy image codec that carries it over the wire.
//!
//! Encoded frames are plain JPEG files, so the header tells any receiver the
//! dimensions and channel count without side-channel metadata.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, ImageBuffer, ImageEncoder, ImageFormat, Rgb};

use crate::error::{DecodeError, Result, StreamError};

/// Payloads shorter than this cannot hold a JPEG header and are rejected
/// before the decoder runs.
pub const MIN_PAYLOAD_LEN: usize = 10;

/// Default JPEG quality.
pub const DEFAULT_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Gray,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Gray => 1,
        }
    }
}

/// One screen image, packed rows with no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Vec<u8>) -> Result<Self> {
        let frame = Self {
            width,
            height,
            format,
            pixels,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Fields are public, so anything handed to the encoder is re-checked here.
    pub fn validate(&self) -> Result<()> {
        let expected = self.width as usize * self.height as usize * self.format.channels();
        if self.pixels.len() != expected || self.width == 0 || self.height == 0 {
            return Err(StreamError::InvalidFrame {
                width: self.width,
                height: self.height,
                expected,
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }

    /// A frame where every pixel has the colour `rgb`.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 3);
        for _ in 0..count {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            format: PixelFormat::Rgb,
            pixels,
        }
    }

    /// Channel values of the pixel at (`x`, `y`), or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let channels = self.format.channels();
        let offset = (y as usize * self.width as usize + x as usize) * channels;
        self.pixels.get(offset..offset + channels)
    }
}

/// JPEG codec with a fixed quality level.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    quality: u8,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl FrameCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress `frame`, first reducing it to luminance when `grayscale` is set.
    pub fn encode(&self, frame: &Frame, grayscale: bool) -> Result<Vec<u8>> {
        // The JPEG encoder asserts on a length mismatch instead of returning an error.
        frame.validate()?;

        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
        let (w, h) = (frame.width, frame.height);

        let written = match (frame.format, grayscale) {
            (PixelFormat::Gray, _) => encoder.write_image(&frame.pixels, w, h, ExtendedColorType::L8),
            (PixelFormat::Rgb, false) => {
                encoder.write_image(&frame.pixels, w, h, ExtendedColorType::Rgb8)
            }
            (PixelFormat::Rgb, true) => {
                let view: ImageBuffer<Rgb<u8>, &[u8]> = ImageBuffer::from_raw(w, h, frame.pixels.as_slice())
                    .ok_or_else(|| StreamError::Encode(format!("{w}x{h} buffer rejected")))?;
                let luma = imageops::grayscale(&view);
                encoder.write_image(luma.as_raw(), w, h, ExtendedColorType::L8)
            }
        };
        written.map_err(|e| StreamError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Decompress a payload into an RGB frame.
    ///
    /// Never panics on bad input: short payloads are rejected up front and
    /// anything the decoder refuses comes back as [`DecodeError::Malformed`].
    pub fn decode(&self, payload: &[u8]) -> std::result::Result<Frame, DecodeError> {
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(DecodeError::TooShort { len: payload.len() });
        }
        let image = image::load_from_memory_with_format(payload, ImageFormat::Jpeg)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        // Grayscale payloads are expanded so sinks only ever see RGB.
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Frame {
            width,
            height,
            format: PixelFormat::Rgb,
            pixels: rgb.into_raw(),
        })
    }
}
