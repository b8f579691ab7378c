//! Audio pipeline.
//!
//! The wire format is fixed: mono, 44.1 kHz, signed 16-bit little-endian PCM,
//! 1024 sample frames per message, sent uncompressed. Devices are opened in
//! that format when they offer it, so samples pass through untouched. A device
//! that cannot run mono 44.1 kHz is opened at its default configuration and
//! converted at the edge instead.

pub mod capture;
pub mod playback;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig, SupportedBufferSize, SupportedStreamConfig,
    SupportedStreamConfigRange};

use crate::error::Result;

pub use capture::{AudioCapturePublisher, MicrophoneSource};
pub use playback::{AudioSubscriberPlayer, SpeakerSink};

pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u16 = 1;
pub const CHUNK_FRAMES: usize = 1024;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const CHUNK_BYTES: usize = CHUNK_FRAMES * CHANNELS as usize * BYTES_PER_SAMPLE;

/// Full scale of a 16-bit sample, so i16 -> f32 -> i16 is exact.
const PCM_SCALE: f32 = 32_768.0;

/// Produces wire-format PCM chunks.
pub trait AudioSource {
    /// Block until one chunk is available or `timeout` passes (`Ok(None)`).
    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Plays wire-format PCM chunks.
pub trait AudioSink {
    /// Queue `chunk` on the device, blocking while the device is full.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

/// Opens an audio source on the capture thread.
pub type OpenAudioSource = Arc<dyn Fn() -> Result<Box<dyn AudioSource>> + Send + Sync>;
/// Opens an audio sink on the playback thread.
pub type OpenAudioSink = Arc<dyn Fn() -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// How a cpal stream is opened.
#[derive(Debug, Clone)]
pub(crate) struct DeviceConfig {
    pub(crate) stream: StreamConfig,
    pub(crate) format: SampleFormat,
}

impl DeviceConfig {
    /// Whether the device runs the wire format itself.
    pub(crate) fn is_native(&self) -> bool {
        self.stream.channels == CHANNELS && self.stream.sample_rate.0 == SAMPLE_RATE
    }

    pub(crate) fn rate(&self) -> u32 {
        self.stream.sample_rate.0
    }

    pub(crate) fn channels(&self) -> u16 {
        self.stream.channels
    }

    /// The device default, for devices without a mono 44.1 kHz mode.
    pub(crate) fn fallback(default: &SupportedStreamConfig) -> Self {
        let format = match default.sample_format() {
            SampleFormat::I16 => SampleFormat::I16,
            _ => SampleFormat::F32,
        };
        Self {
            stream: StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: BufferSize::Default,
            },
            format,
        }
    }
}

/// Picks a mono 44.1 kHz mode from a device's supported ranges, preferring
/// i16 samples over f32. The buffer is pinned to one chunk when the device allows it.
pub(crate) fn wire_config(ranges: impl IntoIterator<Item = SupportedStreamConfigRange>) -> Option<DeviceConfig> {
    let rate = SampleRate(SAMPLE_RATE);
    let ranges: Vec<_> = ranges
        .into_iter()
        .filter(|r| r.channels() == CHANNELS && r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .collect();
    let range = [SampleFormat::I16, SampleFormat::F32]
        .into_iter()
        .find_map(|format| ranges.iter().find(|r| r.sample_format() == format))?;

    let frames = CHUNK_FRAMES as u32;
    let buffer_size = match range.buffer_size() {
        SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => BufferSize::Fixed(frames),
        _ => BufferSize::Default,
    };
    Some(DeviceConfig {
        stream: StreamConfig {
            channels: CHANNELS,
            sample_rate: rate,
            buffer_size,
        },
        format: range.sample_format(),
    })
}

/// Lock-free ring buffer for audio playback.
/// Avoids mutex contention between the network thread and the device callback.
pub(crate) struct RingBuffer {
    buf: Vec<AtomicU32>, // f32 bits stored as u32
    capacity: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

impl RingBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            buf: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    pub(crate) fn available(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        if w >= r {
            w - r
        } else {
            self.capacity - r + w
        }
    }

    pub(crate) fn free_space(&self) -> usize {
        self.capacity - 1 - self.available()
    }

    pub(crate) fn write(&self, samples: &[f32]) -> usize {
        let to_write = samples.len().min(self.free_space());
        let mut pos = self.write_pos.load(Ordering::Relaxed);
        for sample in &samples[..to_write] {
            self.buf[pos].store(sample.to_bits(), Ordering::Relaxed);
            pos = (pos + 1) % self.capacity;
        }
        self.write_pos.store(pos, Ordering::Release);
        to_write
    }

    pub(crate) fn read(&self, output: &mut [f32]) -> usize {
        let to_read = output.len().min(self.available());
        let mut pos = self.read_pos.load(Ordering::Relaxed);
        for slot in &mut output[..to_read] {
            *slot = f32::from_bits(self.buf[pos].load(Ordering::Relaxed));
            pos = (pos + 1) % self.capacity;
        }
        self.read_pos.store(pos, Ordering::Release);
        to_read
    }

    /// Drop oldest samples to keep latency bounded.
    pub(crate) fn trim_to(&self, max_samples: usize) {
        let avail = self.available();
        if avail > max_samples {
            let skip = avail - max_samples;
            let r = self.read_pos.load(Ordering::Relaxed);
            self.read_pos.store((r + skip) % self.capacity, Ordering::Release);
        }
    }
}

/// Simple linear interpolation resampler.
pub(crate) fn linear_resample(input: &[f32], from_rate: u32, to_rate: u32, output_len: usize) -> Vec<f32> {
    if input.is_empty() {
        return vec![0.0; output_len];
    }
    let ratio = from_rate as f64 / to_rate as f64;
    (0..output_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let idx = src_pos as usize;
            let frac = src_pos - idx as f64;
            let a = input.get(idx).copied().unwrap_or(0.0);
            let b = input.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac as f32
        })
        .collect()
}

pub(crate) fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    ((len as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize
}

pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample * PCM_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub(crate) fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

pub(crate) fn f32_to_pcm16(samples: &[f32], out: &mut Vec<u8>) {
    for &s in samples {
        out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
}

pub(crate) fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16_to_f32(i16::from_le_bytes([b[0], b[1]])))
        .collect()
}

/// Turns interleaved device callbacks into wire-format chunks.
pub(crate) struct PcmChunker {
    device_rate: u32,
    device_channels: u16,
    pending: Vec<u8>,
}

impl PcmChunker {
    pub(crate) fn new(device_rate: u32, device_channels: u16) -> Self {
        Self {
            device_rate,
            device_channels: device_channels.max(1),
            pending: Vec::with_capacity(CHUNK_BYTES * 2),
        }
    }

    fn is_native(&self) -> bool {
        self.device_rate == SAMPLE_RATE && self.device_channels == CHANNELS
    }

    /// Feed one i16 device buffer. A native device's samples are copied as they are.
    pub(crate) fn push_i16(&mut self, data: &[i16]) -> Vec<Vec<u8>> {
        if !self.is_native() {
            let samples: Vec<f32> = data.iter().copied().map(i16_to_f32).collect();
            return self.push(&samples);
        }
        for sample in data {
            self.pending.extend_from_slice(&sample.to_le_bytes());
        }
        self.complete_chunks()
    }

    /// Feed one f32 device buffer; returns every chunk that is now complete.
    pub(crate) fn push(&mut self, data: &[f32]) -> Vec<Vec<u8>> {
        if self.is_native() {
            f32_to_pcm16(data, &mut self.pending);
            return self.complete_chunks();
        }

        let channels = self.device_channels as usize;
        let mono: Vec<f32> = if channels > 1 {
            data.chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        } else {
            data.to_vec()
        };

        let samples = if self.device_rate != SAMPLE_RATE {
            let len = resampled_len(mono.len(), self.device_rate, SAMPLE_RATE);
            linear_resample(&mono, self.device_rate, SAMPLE_RATE, len)
        } else {
            mono
        };
        f32_to_pcm16(&samples, &mut self.pending);
        self.complete_chunks()
    }

    fn complete_chunks(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while self.pending.len() >= CHUNK_BYTES {
            chunks.push(self.pending.drain(..CHUNK_BYTES).collect());
        }
        chunks
    }
}
