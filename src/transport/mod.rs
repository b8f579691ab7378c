//! Publish/subscribe transport.
//!
//! One [`Publisher`] per stream broadcasts opaque byte payloads to every
//! connected [`Subscriber`]. Each payload travels as a single WebSocket binary
//! message over TCP; nothing else is put on the wire. Delivery is best effort:
//! a subscriber that is absent or too slow simply misses messages.

mod publisher;
mod subscriber;

pub use publisher::Publisher;
pub use subscriber::{ChannelCloser, Subscriber};

use std::time::Duration;

use crate::config::DeskcastConfig;
use crate::error::{Result, StreamError};

/// Where a publisher can be reached. Video uses `port`, audio `port + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
}

impl StreamEndpoint {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(StreamError::InvalidEndpoint("empty host".into()));
        }
        if port == u16::MAX {
            return Err(StreamError::InvalidEndpoint(format!(
                "port {port} leaves no room for the audio stream on port+1"
            )));
        }
        let host = if host.eq_ignore_ascii_case("localhost") {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        };
        Ok(Self { host, port })
    }

    pub fn video_port(&self) -> u16 {
        self.port
    }

    pub fn audio_port(&self) -> u16 {
        self.port + 1
    }
}

impl std::fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Queue sizes and retry pacing shared by both ends of a channel.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Per-subscriber outbound queue length on the publisher.
    pub high_water_mark: usize,
    /// Inbound queue length on the subscriber.
    pub receive_queue: usize,
    /// Delay between dial attempts.
    pub reconnect_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            high_water_mark: 8,
            receive_queue: 16,
            reconnect_interval: Duration::from_millis(100),
        }
    }
}

impl From<&DeskcastConfig> for TransportOptions {
    fn from(config: &DeskcastConfig) -> Self {
        Self {
            high_water_mark: config.network.publisher_hwm.max(1),
            receive_queue: config.network.subscriber_queue.max(1),
            reconnect_interval: config.reconnect_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    async fn wait_for_subscribers(publisher: &Publisher, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() < n {
            assert!(Instant::now() < deadline, "subscriber never attached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn localhost_is_normalised() {
        let ep = StreamEndpoint::new("LocalHost", 7000).unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.video_port(), 7000);
        assert_eq!(ep.audio_port(), 7001);
    }

    #[test]
    fn last_port_is_rejected() {
        assert!(StreamEndpoint::new("10.0.0.1", u16::MAX).is_err());
        assert!(StreamEndpoint::new("  ", 7000).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_reaches_subscriber_in_order() {
        let opts = TransportOptions::default();
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let mut sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        wait_for_subscribers(&publisher, 1).await;

        publisher.publish(b"first".to_vec());
        publisher.publish(b"second".to_vec());

        let a = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(a, b"first");
        assert_eq!(b, b"second");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_without_subscribers_is_silent() {
        let publisher = Publisher::bind(0, &TransportOptions::default()).await.unwrap();
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fan_out_to_several_subscribers() {
        let opts = TransportOptions::default();
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let mut a = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        let mut b = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        wait_for_subscribers(&publisher, 2).await;

        publisher.publish(b"hello".to_vec());

        for sub in [&mut a, &mut b] {
            let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
            assert_eq!(msg, b"hello");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscriber_dials_until_publisher_appears() {
        // Reserve a free port, then release it so the subscriber finds nobody.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let opts = TransportOptions::default();
        let mut sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let publisher = Publisher::bind(port, &opts).await.unwrap();
        wait_for_subscribers(&publisher, 1).await;
        publisher.publish(b"late".to_vec());

        let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(msg, b"late");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_unblocks_pending_receive() {
        let opts = TransportOptions::default();
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        let closer = sub.closer();

        let started = Instant::now();
        let receiver = std::thread::spawn(move || {
            let mut sub = sub;
            sub.recv_blocking()
        });
        std::thread::sleep(Duration::from_millis(100));
        closer.close();

        let result = tokio::task::spawn_blocking(move || receiver.join().unwrap())
            .await
            .unwrap();
        assert!(matches!(result, Err(StreamError::ChannelClosed)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_after_close_fails_immediately() {
        let opts = TransportOptions::default();
        let mut sub = Subscriber::connect("127.0.0.1", 9, &opts).unwrap();
        sub.closer().close();
        assert!(sub.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_publisher_detaches_subscribers() {
        let opts = TransportOptions::default();
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let _sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        wait_for_subscribers(&publisher, 1).await;
        publisher.shutdown().await;

        // Port must be free again for a fresh session.
        let rebound = Publisher::bind(port, &opts).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_subscriber_never_blocks_publish() {
        let opts = TransportOptions {
            high_water_mark: 2,
            receive_queue: 2,
            ..TransportOptions::default()
        };
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let mut sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        wait_for_subscribers(&publisher, 1).await;

        // Far more than the queues plus the socket buffers can hold.
        const SENT: u32 = 2_000;
        let started = Instant::now();
        for seq in 0..SENT {
            let mut payload = vec![0u8; 64 * 1024];
            payload[..4].copy_from_slice(&seq.to_le_bytes());
            publisher.publish(payload);
        }
        assert!(started.elapsed() < Duration::from_secs(2), "publish blocked");

        let mut received = Vec::new();
        while let Ok(Ok(payload)) = tokio::time::timeout(Duration::from_millis(500), sub.recv()).await {
            received.push(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]));
        }
        assert!(!received.is_empty());
        assert!(received.len() < SENT as usize, "nothing was dropped");
        assert!(received.windows(2).all(|w| w[0] < w[1]), "out of order: {received:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connection_state_follows_the_publisher() {
        let opts = TransportOptions::default();
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        let closer = sub.closer();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!closer.is_connected());

        let publisher = Publisher::bind(port, &opts).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !closer.is_connected() {
            assert!(Instant::now() < deadline, "never connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        publisher.shutdown().await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while closer.is_connected() {
            assert!(Instant::now() < deadline, "still reported connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(sub);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lost_publisher_surfaces_as_transient_error() {
        let opts = TransportOptions::default();
        let publisher = Publisher::bind(0, &opts).await.unwrap();
        let port = publisher.local_addr().port();
        let mut sub = Subscriber::connect("127.0.0.1", port, &opts).unwrap();
        wait_for_subscribers(&publisher, 1).await;
        publisher.shutdown().await;

        let err = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StreamError::Transport(_)), "got {err:?}");
        assert!(!err.is_closed());
    }
}
