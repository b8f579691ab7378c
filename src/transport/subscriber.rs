use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::TransportOptions;
use crate::error::{Result, StreamError};

type Delivery = Result<Vec<u8>>;

/// Subscribing end of a channel.
///
/// Dials the publisher in the background and keeps re-dialling whenever the
/// connection is lost, so a subscriber can be created before its publisher
/// exists. Every message the publisher sends is delivered; there is no topic
/// filter.
pub struct Subscriber {
    url: String,
    rx: mpsc::Receiver<Delivery>,
    closed: watch::Receiver<bool>,
    closer: ChannelCloser,
    runtime: Handle,
}

/// Tears a [`Subscriber`] down from another thread or task.
///
/// A receive blocked on the channel returns [`StreamError::ChannelClosed`]
/// as soon as [`close`](Self::close) is called.
#[derive(Clone)]
pub struct ChannelCloser {
    closed: Arc<watch::Sender<bool>>,
    linked: watch::Receiver<bool>,
    dialer: AbortHandle,
}

impl ChannelCloser {
    pub fn close(&self) {
        self.closed.send_replace(true);
        self.dialer.abort();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// True while a connection to the publisher is up. A channel that is still
    /// dialling, or that lost its publisher, reports false.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && *self.linked.borrow()
    }
}

impl Subscriber {
    /// Start subscribing to `ws://host:port`. Must be called inside a tokio runtime.
    pub fn connect(host: &str, port: u16, opts: &TransportOptions) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| StreamError::Transport(format!("no async runtime: {e}")))?;
        let url = format!("ws://{host}:{port}");

        let (tx, rx) = mpsc::channel(opts.receive_queue);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (linked_tx, linked_rx) = watch::channel(false);
        let dialer = runtime.spawn(dial_loop(url.clone(), tx, linked_tx, opts.reconnect_interval));

        Ok(Self {
            url,
            rx,
            closed: closed_rx,
            closer: ChannelCloser {
                closed: Arc::new(closed_tx),
                linked: linked_rx,
                dialer: dialer.abort_handle(),
            },
            runtime,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }

    /// Wait for the next message.
    ///
    /// Fails with [`StreamError::ChannelClosed`] once the channel is closed and
    /// with [`StreamError::Transport`] when the connection broke (the channel
    /// keeps re-dialling; the next call may succeed).
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        if *self.closed.borrow() {
            return Err(StreamError::ChannelClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.changed() => Err(StreamError::ChannelClosed),
            delivery = self.rx.recv() => delivery.unwrap_or(Err(StreamError::ChannelClosed)),
        }
    }

    /// Blocking form of [`recv`](Self::recv) for dedicated worker threads.
    ///
    /// Must not be called from inside an async context.
    pub fn recv_blocking(&mut self) -> Result<Vec<u8>> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.recv())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.closer.close();
    }
}

async fn dial_loop(url: String, tx: mpsc::Sender<Delivery>, linked: watch::Sender<bool>, retry: Duration) {
    let mut reported_unreachable = false;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("subscribed to {url}");
                reported_unreachable = false;
                linked.send_replace(true);
                let forwarded = forward_messages(ws, &tx).await;
                linked.send_replace(false);
                match forwarded {
                    Ok(()) => info!("publisher at {url} ended the stream"),
                    Err(e) => {
                        warn!("connection to {url} lost: {e}");
                        if tx.send(Err(e)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                if !reported_unreachable {
                    debug!("publisher at {url} unreachable ({e}); retrying");
                    reported_unreachable = true;
                }
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(retry).await;
    }
}

async fn forward_messages(
    mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tx: &mpsc::Sender<Delivery>,
) -> Result<()> {
    while let Some(msg) = ws.next().await {
        match msg? {
            WsMessage::Binary(payload) => {
                // A full queue parks this reader; TCP backpressure then makes
                // the publisher start dropping for us.
                if tx.send(Ok(payload)).await.is_err() {
                    return Ok(());
                }
            }
            WsMessage::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Err(StreamError::Transport("connection dropped without a close frame".into()))
}
