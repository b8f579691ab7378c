use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::DisplaySink;
use crate::codec::FrameCodec;
use crate::error::{DecodeError, Result};
use crate::transport::Subscriber;
use crate::worker::{receive_loop, Worker};

/// Receive → decode → present loop on its own thread.
///
/// Undecodable payloads are dropped and the loop moves on; nothing is retried.
pub struct ScreenSubscriberRenderer {
    worker: Worker,
}

impl ScreenSubscriberRenderer {
    pub fn start(
        sub: Subscriber,
        codec: FrameCodec,
        sink: Arc<dyn DisplaySink>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let worker = Worker::spawn(
            "screen-receive",
            move || Ok(sub),
            move |sub| {
                let mut shown: u64 = 0;
                let mut dropped: u64 = 0;
                let stats = receive_loop("video", sub, &running, |payload| match codec.decode(&payload) {
                    Ok(frame) => {
                        trace!(bytes = payload.len(), "{}x{} frame", frame.width, frame.height);
                        sink.present(frame);
                        shown += 1;
                    }
                    Err(DecodeError::TooShort { len }) => {
                        debug!("ignoring {len}-byte payload");
                        dropped += 1;
                    }
                    Err(e) => {
                        warn!("failed to decode frame: {e}");
                        dropped += 1;
                    }
                });
                info!(
                    "screen receiver stopped ({shown} shown, {dropped} dropped, {} transport errors)",
                    stats.transient_errors
                );
            },
        )?;
        Ok(Self { worker })
    }

    pub fn join(self) {
        self.worker.join();
    }
}
