use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, trace, warn};

use super::TransportOptions;
use crate::error::Result;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Peer {
    addr: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

type PeerList = Arc<Mutex<Vec<Peer>>>;

/// Publishing end of a channel, bound to all local interfaces.
///
/// Exactly one producer calls [`publish`](Self::publish); any number of
/// subscribers may attach. Dropping the publisher disconnects them all.
pub struct Publisher {
    local_addr: SocketAddr,
    peers: PeerList,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    pub async fn bind(port: u16, opts: &TransportOptions) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        let peers: PeerList = Arc::new(Mutex::new(Vec::new()));

        let accept_task = tokio::spawn(accept_loop(listener, peers.clone(), opts.high_water_mark));
        info!("publishing on {local_addr}");

        Ok(Self {
            local_addr,
            peers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand `payload` to every attached subscriber without waiting.
    ///
    /// Subscribers whose queue is full miss this message; nothing is reported
    /// back to the caller either way.
    pub fn publish(&self, payload: Vec<u8>) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|peer| match peer.tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("subscriber {} lagging, message dropped", peer.addr);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|peer| !peer.tx.is_closed());
        peers.len()
    }

    /// Stop accepting, disconnect every subscriber and release the port.
    pub async fn shutdown(mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        debug!("publisher on {} shut down", self.local_addr);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, peers: PeerList, hwm: usize) {
    // Owning the subscriber tasks here means aborting this task tears them all down.
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tasks.spawn(serve_subscriber(stream, addr, peers.clone(), hwm));
                }
                Err(e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
}

async fn serve_subscriber(stream: TcpStream, addr: SocketAddr, peers: PeerList, hwm: usize) {
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("rejected connection from {addr}: {e}");
            return;
        }
        Err(_) => {
            debug!("handshake with {addr} timed out");
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(hwm);
    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Peer { addr, tx });
    info!("subscriber {addr} attached");

    let (mut ws_sender, mut ws_receiver) = ws.split();
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(payload) => {
                    if let Err(e) = ws_sender.send(WsMessage::Binary(payload)).await {
                        debug!("send to {addr} failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("subscriber {addr} errored: {e}");
                    break;
                }
                // Subscribers have nothing to say; pings are answered by the library.
                Some(Ok(_)) => {}
            },
        }
    }

    // Closing the receiver makes the next publish prune this peer.
    rx.close();
    let _ = tokio::time::timeout(Duration::from_secs(1), ws_sender.close()).await;
    info!("subscriber {addr} detached");
}
