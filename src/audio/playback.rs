use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use tracing::{debug, info, warn};

use super::{
    f32_to_i16, linear_resample, pcm16_to_f32, resampled_len, wire_config, AudioSink, DeviceConfig, OpenAudioSink,
    RingBuffer, CHANNELS, SAMPLE_RATE,
};
use crate::error::{Result, StreamError};
use crate::transport::Subscriber;
use crate::worker::{receive_loop, Worker};

/// Most audio queued ahead of the device, in milliseconds.
const MAX_LATENCY_MS: usize = 500;
/// Longest a write waits for the device to make room before older audio is discarded.
const WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Default output device fed from a lock-free ring buffer.
pub struct SpeakerSink {
    _stream: cpal::Stream,
    ring: Arc<RingBuffer>,
    out_rate: u32,
    out_channels: u16,
}

impl SpeakerSink {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| StreamError::DeviceUnavailable("no audio output device found".into()))?;

        let native = device
            .supported_output_configs()
            .map_err(|e| StreamError::DeviceUnavailable(format!("cannot query output configs: {e}")))?;
        let config = match wire_config(native) {
            Some(config) => config,
            None => {
                let default = device
                    .default_output_config()
                    .map_err(|e| StreamError::DeviceUnavailable(format!("no default output config: {e}")))?;
                warn!(
                    "speaker has no mono {SAMPLE_RATE} Hz mode, converting to {} Hz, {} channel(s)",
                    default.sample_rate().0,
                    default.channels()
                );
                DeviceConfig::fallback(&default)
            }
        };
        let out_rate = config.rate();
        let out_channels = config.channels();

        // The ring holds exactly the latency budget, so a full ring means the device is behind.
        let ring_capacity = out_rate as usize * out_channels as usize * MAX_LATENCY_MS / 1000;
        let ring = Arc::new(RingBuffer::new(ring_capacity));
        let reader = ring.clone();

        let on_error = |err: cpal::StreamError| warn!("audio playback error: {err}");
        let mut last_sample = 0.0f32;
        let stream = match config.format {
            SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &config.stream,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        drain_ring(&reader, &mut scratch, &mut last_sample);
                        for (out, &sample) in data.iter_mut().zip(&scratch) {
                            *out = f32_to_i16(sample);
                        }
                    },
                    on_error,
                    None,
                )
            }
            _ => device.build_output_stream(
                &config.stream,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| drain_ring(&reader, data, &mut last_sample),
                on_error,
                None,
            ),
        }
        .map_err(|e| StreamError::DeviceUnavailable(format!("cannot open speaker: {e}")))?;
        stream
            .play()
            .map_err(|e| StreamError::DeviceUnavailable(format!("cannot start speaker: {e}")))?;

        info!(
            "speaker open at {out_rate} Hz, {out_channels} channel(s), {:?}{}",
            config.format,
            if config.is_native() { "" } else { " (converted)" }
        );
        Ok(Self {
            _stream: stream,
            ring,
            out_rate,
            out_channels,
        })
    }
}

/// Fill `data` from the ring, fading to silence on underrun instead of clicking.
fn drain_ring(ring: &RingBuffer, data: &mut [f32], last_sample: &mut f32) {
    let read = ring.read(data);
    if read > 0 {
        *last_sample = data[read - 1];
    }
    for sample in data[read..].iter_mut() {
        *last_sample *= 0.95;
        *sample = *last_sample;
    }
}

/// Wire chunk to interleaved device samples. A mono 44.1 kHz device gets the
/// chunk's samples one for one.
fn to_device_samples(chunk: &[u8], out_rate: u32, out_channels: u16) -> Vec<f32> {
    let mono = pcm16_to_f32(chunk);
    if out_rate == SAMPLE_RATE && out_channels == CHANNELS {
        return mono;
    }
    let resampled = if out_rate != SAMPLE_RATE {
        let len = resampled_len(mono.len(), SAMPLE_RATE, out_rate);
        linear_resample(&mono, SAMPLE_RATE, out_rate, len)
    } else {
        mono
    };
    resampled
        .iter()
        .flat_map(|&s| std::iter::repeat(s).take(out_channels as usize))
        .collect()
}

impl AudioSink for SpeakerSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let samples = to_device_samples(chunk, self.out_rate, self.out_channels);

        let deadline = Instant::now() + WRITE_TIMEOUT;
        while self.ring.free_space() < samples.len() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let room = self.ring.free_space();
        if room < samples.len() {
            debug!("playback behind, discarding {} queued samples", samples.len() - room);
            let keep = self.ring.available().saturating_sub(samples.len() - room);
            self.ring.trim_to(keep);
        }
        self.ring.write(&samples);
        Ok(())
    }
}

/// Receive → play loop on its own thread.
pub struct AudioSubscriberPlayer {
    worker: Worker,
}

impl AudioSubscriberPlayer {
    /// Opens the sink on the playback thread; fails if the device is missing.
    pub fn start(sub: Subscriber, open: OpenAudioSink, running: Arc<AtomicBool>) -> Result<Self> {
        let worker = Worker::spawn(
            "audio-receive",
            move || open().map(|sink| (sink, sub)),
            move |(mut sink, sub)| {
                let mut played: u64 = 0;
                let stats = receive_loop("audio", sub, &running, |chunk| match sink.write_chunk(&chunk) {
                    Ok(()) => played += 1,
                    Err(e) => warn!("failed to play audio chunk: {e}"),
                });
                debug!(
                    "audio player stopped after {played} of {} chunks ({} transport errors)",
                    stats.delivered, stats.transient_errors
                );
            },
        )?;
        Ok(Self { worker })
    }

    pub fn join(self) {
        self.worker.join();
    }
}
