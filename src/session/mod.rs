//! Publisher and subscriber sessions.
//!
//! A session owns its channels and worker threads from `start` to `stop`. No
//! state survives a session: reconnecting builds a brand-new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::audio::{
    AudioCapturePublisher, AudioSink, AudioSource, AudioSubscriberPlayer, MicrophoneSource, OpenAudioSink,
    OpenAudioSource, SpeakerSink,
};
use crate::codec::FrameCodec;
use crate::config::DeskcastConfig;
use crate::error::Result;
use crate::screen::{
    DisplaySink, DisplaySource, OpenScreenSource, ScreenCapturePublisher, ScreenSource, ScreenSubscriberRenderer,
};
use crate::transport::{ChannelCloser, Publisher, StreamEndpoint, Subscriber, TransportOptions};

/// Where a publisher session gets its media from.
pub struct PublisherSources {
    pub screen: OpenScreenSource,
    /// `None` publishes video only and leaves `port + 1` unbound.
    pub audio: Option<OpenAudioSource>,
}

impl PublisherSources {
    /// The primary display and, if enabled, the default microphone.
    pub fn devices(config: &DeskcastConfig) -> Self {
        let max_width = config.screen.max_width;
        let screen: OpenScreenSource = Arc::new(move || -> Result<Box<dyn ScreenSource>> {
            Ok(Box::new(DisplaySource::open_primary(max_width)?))
        });
        let audio: Option<OpenAudioSource> = config.audio.enabled.then(|| {
            Arc::new(|| -> Result<Box<dyn AudioSource>> { Ok(Box::new(MicrophoneSource::open_default()?)) })
                as OpenAudioSource
        });
        Self { screen, audio }
    }
}

/// Where a subscriber session sends what it receives. Reused across reconnects.
#[derive(Clone)]
pub struct SubscriberSinks {
    pub display: Arc<dyn DisplaySink>,
    /// `None` skips the audio channel entirely.
    pub audio: Option<OpenAudioSink>,
}

impl SubscriberSinks {
    /// `display` plus, if enabled, the default speaker.
    pub fn with_speaker(display: Arc<dyn DisplaySink>, config: &DeskcastConfig) -> Self {
        let audio: Option<OpenAudioSink> = config.audio.enabled.then(|| {
            Arc::new(|| -> Result<Box<dyn AudioSink>> { Ok(Box::new(SpeakerSink::open_default()?)) })
                as OpenAudioSink
        });
        Self { display, audio }
    }
}

/// Hosting role: capture loops publishing on `port` (video) and `port + 1` (audio).
pub struct PublisherSession {
    running: Arc<AtomicBool>,
    video: Arc<Publisher>,
    audio: Option<Arc<Publisher>>,
    screen_worker: ScreenCapturePublisher,
    audio_worker: Option<AudioCapturePublisher>,
}

impl PublisherSession {
    /// Bind the channels, open the devices and start capturing.
    ///
    /// Any device that cannot be opened aborts the whole session.
    pub async fn start(config: &DeskcastConfig, sources: PublisherSources) -> Result<Self> {
        let endpoint = StreamEndpoint::new("0.0.0.0", config.network.port)?;
        let opts = TransportOptions::from(config);
        let codec = FrameCodec::new(config.jpeg_quality());

        let video = Arc::new(Publisher::bind(endpoint.video_port(), &opts).await?);
        let audio = match sources.audio {
            Some(_) => Some(Arc::new(Publisher::bind(endpoint.audio_port(), &opts).await?)),
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        let screen_worker = ScreenCapturePublisher::start(
            sources.screen,
            codec,
            config.screen.grayscale,
            video.clone(),
            running.clone(),
        )?;

        let audio_worker = match (sources.audio, &audio) {
            (Some(open), Some(publisher)) => {
                match AudioCapturePublisher::start(
                    open,
                    config.audio_read_timeout(),
                    publisher.clone(),
                    running.clone(),
                ) {
                    Ok(worker) => Some(worker),
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = tokio::task::spawn_blocking(move || screen_worker.join()).await;
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        info!(
            "hosting on port {} (video){}",
            endpoint.video_port(),
            if audio.is_some() {
                format!(" and {} (audio)", endpoint.audio_port())
            } else {
                String::new()
            }
        );

        Ok(Self {
            running,
            video,
            audio,
            screen_worker,
            audio_worker,
        })
    }

    pub fn video_port(&self) -> u16 {
        self.video.local_addr().port()
    }

    pub fn audio_port(&self) -> Option<u16> {
        self.audio.as_ref().map(|p| p.local_addr().port())
    }

    pub fn subscriber_count(&self) -> usize {
        self.video.subscriber_count()
    }

    /// Stop the capture loops, then release the devices and the ports.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);

        let screen_worker = self.screen_worker;
        let audio_worker = self.audio_worker;
        let joined = tokio::task::spawn_blocking(move || {
            screen_worker.join();
            if let Some(worker) = audio_worker {
                worker.join();
            }
        })
        .await;
        if joined.is_err() {
            warn!("capture workers did not shut down cleanly");
        }

        for publisher in std::iter::once(self.video).chain(self.audio) {
            if let Ok(publisher) = Arc::try_unwrap(publisher) {
                publisher.shutdown().await;
            }
        }
        info!("publisher session stopped");
    }
}

/// Viewing role: receive loops fed by channels connected to one endpoint.
pub struct SubscriberSession {
    endpoint: StreamEndpoint,
    running: Arc<AtomicBool>,
    closers: Vec<ChannelCloser>,
    screen_worker: ScreenSubscriberRenderer,
    audio_worker: Option<AudioSubscriberPlayer>,
}

impl SubscriberSession {
    /// Connect the channels and start the receive loops.
    ///
    /// Must be called inside a multi-threaded tokio runtime; the loops block
    /// their own threads on it.
    pub fn start(
        endpoint: &StreamEndpoint,
        opts: &TransportOptions,
        codec: FrameCodec,
        sinks: &SubscriberSinks,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut closers = Vec::new();

        let audio_worker = match &sinks.audio {
            Some(open) => {
                let sub = Subscriber::connect(&endpoint.host, endpoint.audio_port(), opts)?;
                let closer = sub.closer();
                // Opening the speaker can fail; the dropped subscriber closes itself.
                let worker = AudioSubscriberPlayer::start(sub, open.clone(), running.clone())?;
                closers.push(closer);
                Some(worker)
            }
            None => None,
        };

        let video = match Subscriber::connect(&endpoint.host, endpoint.video_port(), opts) {
            Ok(sub) => sub,
            Err(e) => {
                Self::abort(&running, &closers, audio_worker);
                return Err(e);
            }
        };
        closers.push(video.closer());
        let screen_worker = match ScreenSubscriberRenderer::start(
            video,
            codec,
            sinks.display.clone(),
            running.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                Self::abort(&running, &closers, audio_worker);
                return Err(e);
            }
        };

        info!("viewing {endpoint}");
        Ok(Self {
            endpoint: endpoint.clone(),
            running,
            closers,
            screen_worker,
            audio_worker,
        })
    }

    fn abort(running: &AtomicBool, closers: &[ChannelCloser], audio: Option<AudioSubscriberPlayer>) {
        running.store(false, Ordering::SeqCst);
        for closer in closers {
            closer.close();
        }
        if let Some(worker) = audio {
            worker.join();
        }
    }

    pub fn endpoint(&self) -> &StreamEndpoint {
        &self.endpoint
    }

    /// False once the channels have been closed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.closers.iter().any(ChannelCloser::is_closed)
    }

    /// True while every channel of a running session has a live connection.
    pub fn is_connected(&self) -> bool {
        self.is_running() && self.closers.iter().all(ChannelCloser::is_connected)
    }

    /// Close the channels. Receive loops blocked on them exit at once.
    pub fn close_channels(&self) {
        for closer in &self.closers {
            closer.close();
        }
    }

    /// Clear the running flag, close the channels and wait for the loops.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.close_channels();

        let screen_worker = self.screen_worker;
        let audio_worker = self.audio_worker;
        let joined = tokio::task::spawn_blocking(move || {
            screen_worker.join();
            if let Some(worker) = audio_worker {
                worker.join();
            }
        })
        .await;
        if joined.is_err() {
            warn!("receive workers did not shut down cleanly");
        }
        info!("stopped viewing {}", self.endpoint);
    }
}

/// Supervises the subscriber role and replaces its session on demand.
///
/// Reconnecting never happens from inside a receive loop; whoever owns the
/// viewer decides when to call [`reconnect`](Self::reconnect).
pub struct Viewer {
    endpoint: StreamEndpoint,
    opts: TransportOptions,
    codec: FrameCodec,
    sinks: SubscriberSinks,
    reconnect_delay: Duration,
    session: Option<SubscriberSession>,
}

impl Viewer {
    pub fn new(config: &DeskcastConfig, sinks: SubscriberSinks) -> Result<Self> {
        Ok(Self {
            endpoint: StreamEndpoint::new(&config.network.host, config.network.port)?,
            opts: TransportOptions::from(config),
            codec: FrameCodec::new(config.jpeg_quality()),
            sinks,
            reconnect_delay: config.reconnect_delay(),
            session: None,
        })
    }

    pub fn endpoint(&self) -> &StreamEndpoint {
        &self.endpoint
    }

    pub fn session(&self) -> Option<&SubscriberSession> {
        self.session.as_ref()
    }

    /// Whether the publisher is actually reachable right now, not merely dialled.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(SubscriberSession::is_connected)
    }

    /// Start a session if none is live.
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.session = Some(SubscriberSession::start(&self.endpoint, &self.opts, self.codec, &self.sinks)?);
        }
        Ok(())
    }

    /// Tear the current session down, wait, and start a fresh one to the same endpoint.
    pub async fn reconnect(&mut self) -> Result<()> {
        info!("reconnecting to {}", self.endpoint);
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        tokio::time::sleep(self.reconnect_delay).await;
        self.start()
    }

    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
    }
}
