//! Dedicated worker threads for the pipeline loops.
//!
//! Each loop owns its device handle for its whole life: the handle is opened
//! on the worker thread (several platform handles are not `Send`) and dropped
//! there when the loop returns. Opening happens before `spawn` returns, so a
//! missing device is reported to the caller before any loop runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::error::{Result, StreamError};
use crate::transport::Subscriber;

pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Run `open` on a new thread, then `body` with whatever it produced.
    ///
    /// Blocks until `open` has finished and returns its error, if any.
    pub(crate) fn spawn<R, O, B>(name: &'static str, open: O, body: B) -> Result<Self>
    where
        O: FnOnce() -> Result<R> + Send + 'static,
        B: FnOnce(R) + Send + 'static,
        R: 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let resource = match open() {
                    Ok(resource) => resource,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                body(resource);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { name, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                error!("{name} failed to start: {e}");
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(StreamError::DeviceUnavailable(format!(
                    "{name} exited while opening its device"
                )))
            }
        }
    }

    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            warn!("{} worker panicked", self.name);
        } else {
            debug!("{} worker finished", self.name);
        }
    }
}

/// What a receive loop went through before it ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReceiveStats {
    pub(crate) delivered: u64,
    pub(crate) transient_errors: u64,
}

/// Pull messages off `sub` until the flag clears or the channel is closed.
///
/// Transient transport failures are logged and the loop keeps going; closure
/// ends it quietly.
pub(crate) fn receive_loop(
    stream: &str,
    mut sub: Subscriber,
    running: &AtomicBool,
    mut on_message: impl FnMut(Vec<u8>),
) -> ReceiveStats {
    let mut stats = ReceiveStats::default();
    while running.load(Ordering::Relaxed) {
        match sub.recv_blocking() {
            Ok(payload) => {
                stats.delivered += 1;
                on_message(payload);
            }
            Err(StreamError::ChannelClosed) => {
                debug!("{stream} channel closed");
                break;
            }
            Err(e) => {
                stats.transient_errors += 1;
                warn!("{stream} receive failed: {e}");
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn open_failure_is_reported_synchronously() {
        let body_ran = Arc::new(AtomicBool::new(false));
        let flag = body_ran.clone();
        let result = Worker::spawn(
            "test-capture",
            || Err::<(), _>(StreamError::DeviceUnavailable("no microphone".into())),
            move |_| flag.store(true, Ordering::SeqCst),
        );
        assert!(matches!(result, Err(StreamError::DeviceUnavailable(_))));
        assert!(!body_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn resource_reaches_body() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = Worker::spawn("test-ok", || Ok(41), move |n| tx.send(n + 1).unwrap()).unwrap();
        worker.join();
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn panicking_open_is_a_device_error() {
        let result = Worker::spawn("test-panic", || -> Result<()> { panic!("driver crashed") }, |_| {});
        assert!(matches!(result, Err(StreamError::DeviceUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_loop_outlives_a_dropped_connection() {
        use crate::transport::{Publisher, TransportOptions};
        use std::time::{Duration, Instant};

        let opts = TransportOptions {
            reconnect_interval: Duration::from_millis(20),
            ..TransportOptions::default()
        };
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        let closer = sub.closer();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let receiver = std::thread::spawn(move || {
            receive_loop("test", sub, &flag, |payload| {
                let _ = tx.send(payload);
            })
        });

        async fn publish_until_seen(
            publisher: &Publisher,
            payload: &[u8],
            rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        ) {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                assert!(Instant::now() < deadline, "{payload:?} never arrived");
                publisher.publish(payload.to_vec());
                if let Ok(Some(got)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
                    if got == payload {
                        return;
                    }
                }
            }
        }

        publish_until_seen(&publisher, b"before", &mut rx).await;

        // Kill the connection without a close handshake, then come back on the same port.
        publisher.shutdown().await;
        let publisher = Publisher::bind(port, &opts).await.unwrap();
        publish_until_seen(&publisher, b"after", &mut rx).await;

        closer.close();
        let stats = tokio::task::spawn_blocking(move || receiver.join().unwrap())
            .await
            .unwrap();
        assert!(stats.transient_errors >= 1, "{stats:?}");
        assert!(stats.delivered >= 2);
        assert!(running.load(Ordering::SeqCst));
    }
}
