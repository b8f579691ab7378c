use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use tracing::{debug, info, trace, warn};

use super::{wire_config, AudioSource, DeviceConfig, OpenAudioSource, PcmChunker, SAMPLE_RATE};
use crate::error::{Result, StreamError};
use crate::transport::Publisher;
use crate::worker::Worker;

/// Chunks buffered between the device callback and the reading thread.
const CAPTURE_BACKLOG: usize = 32;

/// Default input device, delivering wire-format chunks.
pub struct MicrophoneSource {
    _stream: cpal::Stream,
    chunks: mpsc::Receiver<Vec<u8>>,
}

impl MicrophoneSource {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| StreamError::DeviceUnavailable("no audio input device found".into()))?;

        let native = device
            .supported_input_configs()
            .map_err(|e| StreamError::DeviceUnavailable(format!("cannot query input configs: {e}")))?;
        let config = match wire_config(native) {
            Some(config) => config,
            None => {
                let default = device
                    .default_input_config()
                    .map_err(|e| StreamError::DeviceUnavailable(format!("no default input config: {e}")))?;
                warn!(
                    "microphone has no mono {SAMPLE_RATE} Hz mode, converting from {} Hz, {} channel(s)",
                    default.sample_rate().0,
                    default.channels()
                );
                DeviceConfig::fallback(&default)
            }
        };

        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(CAPTURE_BACKLOG);
        let mut chunker = PcmChunker::new(config.rate(), config.channels());
        let send = move |chunks: Vec<Vec<u8>>| {
            for chunk in chunks {
                if let Err(TrySendError::Full(_)) = tx.try_send(chunk) {
                    trace!("capture backlog full, chunk dropped");
                }
            }
        };

        let on_error = |err: cpal::StreamError| warn!("audio capture error: {err}");
        let stream = match config.format {
            SampleFormat::I16 => device.build_input_stream(
                &config.stream,
                move |data: &[i16], _: &cpal::InputCallbackInfo| send(chunker.push_i16(data)),
                on_error,
                None,
            ),
            _ => device.build_input_stream(
                &config.stream,
                move |data: &[f32], _: &cpal::InputCallbackInfo| send(chunker.push(data)),
                on_error,
                None,
            ),
        }
        .map_err(|e| StreamError::DeviceUnavailable(format!("cannot open microphone: {e}")))?;
        stream
            .play()
            .map_err(|e| StreamError::DeviceUnavailable(format!("cannot start microphone: {e}")))?;

        info!(
            "microphone open at {} Hz, {} channel(s), {:?}{}",
            config.rate(),
            config.channels(),
            config.format,
            if config.is_native() { "" } else { " (converted)" }
        );
        Ok(Self {
            _stream: stream,
            chunks: rx,
        })
    }
}

impl AudioSource for MicrophoneSource {
    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.chunks.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::DeviceUnavailable(
                "audio input stream ended".into(),
            )),
        }
    }
}

/// Read chunk → publish loop on its own thread.
pub struct AudioCapturePublisher {
    worker: Worker,
}

impl AudioCapturePublisher {
    /// `read_timeout` bounds each blocking read so a stop request is seen promptly.
    pub fn start(
        open: OpenAudioSource,
        read_timeout: Duration,
        publisher: Arc<Publisher>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let worker = Worker::spawn(
            "audio-capture",
            move || open(),
            move |mut source| {
                let mut sent: u64 = 0;
                while running.load(Ordering::Relaxed) {
                    match source.read_chunk(read_timeout) {
                        Ok(Some(chunk)) => {
                            trace!(seq = sent, bytes = chunk.len(), "sent audio chunk");
                            publisher.publish(chunk);
                            sent += 1;
                        }
                        Ok(None) => {}
                        Err(e @ StreamError::DeviceUnavailable(_)) => {
                            warn!("audio capture ending: {e}");
                            break;
                        }
                        Err(e) => warn!("audio read failed: {e}"),
                    }
                }
                debug!("audio capture stopped after {sent} chunks");
            },
        )?;
        Ok(Self { worker })
    }

    pub fn join(self) {
        self.worker.join();
    }
}
