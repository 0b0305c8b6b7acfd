use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Events a transport reports for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Reconnecting,
    Reconnected,
    Disconnected { reason: String },
    TrackReceived(MediaTrack),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

pub struct TransportLink {
    pub handle: TransportHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Media transport collaborator. Reconnection policy lives behind this trait;
/// a `Disconnected` event means the transport has given up.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<TransportLink, TransportError>;

    async fn disconnect(&self, handle: TransportHandle);
}

/// Where inbound video ends up.
pub trait MediaSurface: Send + Sync {
    fn attach(&self, track: &MediaTrack);
}

/// Surface that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl MediaSurface for NullSurface {
    fn attach(&self, _track: &MediaTrack) {}
}

/// What a realtime session reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    State(ConnectionState),
    TrackAttached(MediaTrack),
    /// Terminal: the connection failed or the transport gave up reconnecting.
    Lost { reason: String },
}

/// One media session bound to a lease token.
pub struct RealtimeSession {
    state: watch::Receiver<ConnectionState>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    close_grace: Duration,
}

impl RealtimeSession {
    /// Starts connecting in the background and returns immediately in
    /// `Connecting`.
    pub fn open(
        transport: Arc<dyn RealtimeTransport>,
        token: String,
        surface: Arc<dyn MediaSurface>,
        events: mpsc::UnboundedSender<RealtimeEvent>,
        close_grace: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (close_tx, close_rx) = oneshot::channel();
        let driver = SessionDriver {
            transport,
            surface,
            state: state_tx,
            events,
        };
        driver.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(driver.run(token, close_rx));
        Self {
            state: state_rx,
            close_tx: Some(close_tx),
            task: Some(task),
            close_grace,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Tears the session down whatever its state. Safe to call repeatedly.
    /// Waits at most the close grace for the transport to let go.
    pub async fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        let Some(task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(self.close_grace, task).await {
            Ok(Ok(())) => debug!(target = "scope.realtime", "realtime session closed"),
            Ok(Err(err)) => warn!(target = "scope.realtime", error = %err, "realtime task ended abnormally"),
            Err(_) => warn!(
                target = "scope.realtime",
                grace_ms = self.close_grace.as_millis() as u64,
                "realtime session did not close within grace; leaving it to finish"
            ),
        }
    }
}

struct SessionDriver {
    transport: Arc<dyn RealtimeTransport>,
    surface: Arc<dyn MediaSurface>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<RealtimeEvent>,
}

impl SessionDriver {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(target = "scope.realtime", ?previous, ?next, "connection state");
            let _ = self.events.send(RealtimeEvent::State(next));
        }
    }

    async fn run(self, token: String, mut close_rx: oneshot::Receiver<()>) {
        // Connect is never cancelled halfway: a close that arrives meanwhile is
        // honoured as soon as the outcome is known.
        let mut link = match self.transport.connect(&token).await {
            Ok(link) => link,
            Err(err) => {
                let closing = close_requested(&mut close_rx);
                self.set_state(ConnectionState::Disconnected);
                if !closing {
                    warn!(target = "scope.realtime", error = %err, "realtime connect failed");
                    let _ = self.events.send(RealtimeEvent::Lost {
                        reason: err.to_string(),
                    });
                }
                return;
            }
        };
        let handle = link.handle;
        if close_requested(&mut close_rx) {
            self.transport.disconnect(handle).await;
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        info!(target = "scope.realtime", handle = handle.0, "realtime session connected");
        self.set_state(ConnectionState::Connected);

        let lost = loop {
            tokio::select! {
                biased;
                _ = &mut close_rx => break None,
                event = link.events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.apply(event) {
                            break Some(reason);
                        }
                    }
                    None => break Some("transport closed the event stream".to_string()),
                },
            }
        };

        self.transport.disconnect(handle).await;
        self.set_state(ConnectionState::Disconnected);
        if let Some(reason) = lost {
            warn!(target = "scope.realtime", handle = handle.0, %reason, "realtime session lost");
            let _ = self.events.send(RealtimeEvent::Lost { reason });
        }
    }

    /// Applies one transport event; returns a reason when the session is over.
    fn apply(&self, event: TransportEvent) -> Option<String> {
        match event {
            TransportEvent::Connected | TransportEvent::Reconnected => {
                self.set_state(ConnectionState::Connected);
            }
            TransportEvent::Reconnecting => {
                self.set_state(ConnectionState::Reconnecting);
            }
            TransportEvent::TrackReceived(track) => {
                if self.current() == ConnectionState::Connected && track.kind == TrackKind::Video
                {
                    self.surface.attach(&track);
                    let _ = self.events.send(RealtimeEvent::TrackAttached(track));
                } else {
                    debug!(target = "scope.realtime", track = %track.id, kind = ?track.kind, "track ignored");
                }
            }
            TransportEvent::Disconnected { reason } => return Some(reason),
        }
        None
    }
}

fn close_requested(close_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        close_rx.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

/// In-process transport whose events are driven by the caller. Backs tests and
/// the console's offline mode.
#[derive(Default)]
pub struct LoopbackTransport {
    next_handle: AtomicU64,
    links: Mutex<HashMap<u64, mpsc::UnboundedSender<TransportEvent>>>,
    tokens: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<TransportHandle>>,
    refuse_connect: AtomicBool,
    video_on_connect: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Loopback that publishes one video track as soon as a link is up.
    pub fn with_video() -> Arc<Self> {
        let transport = Self::default();
        transport.video_on_connect.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Delivers `event` to every live link. Returns how many links received it.
    pub fn emit(&self, event: TransportEvent) -> usize {
        self.links
            .lock()
            .values()
            .filter(|link| link.send(event.clone()).is_ok())
            .count()
    }

    pub fn live_links(&self) -> usize {
        self.links.lock().len()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn disconnects(&self) -> Vec<TransportHandle> {
        self.disconnects.lock().clone()
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn connect(&self, token: &str) -> Result<TransportLink, TransportError> {
        self.tokens.lock().push(token.to_string());
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("loopback refused connection".into()));
        }
        let handle = TransportHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        if self.video_on_connect.load(Ordering::SeqCst) {
            let _ = tx.send(TransportEvent::TrackReceived(MediaTrack {
                id: format!("loopback-video-{}", handle.0),
                kind: TrackKind::Video,
            }));
        }
        self.links.lock().insert(handle.0, tx);
        Ok(TransportLink { handle, events: rx })
    }

    async fn disconnect(&self, handle: TransportHandle) {
        self.links.lock().remove(&handle.0);
        self.disconnects.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSurface {
        attached: Mutex<Vec<MediaTrack>>,
    }

    impl MediaSurface for RecordingSurface {
        fn attach(&self, track: &MediaTrack) {
            self.attached.lock().push(track.clone());
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RealtimeEvent>) -> RealtimeEvent {
        rx.recv().await.expect("realtime event")
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connects_attaches_video_and_closes_once() {
        let transport = LoopbackTransport::with_video();
        let surface = Arc::new(RecordingSurface::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = RealtimeSession::open(
            transport.clone(),
            "tok".into(),
            surface.clone(),
            tx,
            Duration::from_secs(1),
        );
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Connecting));
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Connected));
        assert!(matches!(next_event(&mut rx).await, RealtimeEvent::TrackAttached(_)));
        assert_eq!(surface.attached.lock().len(), 1);
        assert_eq!(transport.tokens(), vec!["tok".to_string()]);

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnects().len(), 1);
        assert_eq!(transport.live_links(), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn reconnect_cycle_then_terminal_disconnect() {
        let transport = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = RealtimeSession::open(
            transport.clone(),
            "tok".into(),
            Arc::new(NullSurface),
            tx,
            Duration::from_secs(1),
        );
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Connecting));
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Connected));

        transport.emit(TransportEvent::Reconnecting);
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Reconnecting));
        transport.emit(TransportEvent::Reconnected);
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Connected));

        transport.emit(TransportEvent::Disconnected {
            reason: "peer gone".into(),
        });
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Disconnected));
        assert_eq!(
            next_event(&mut rx).await,
            RealtimeEvent::Lost {
                reason: "peer gone".into()
            }
        );
        session.close().await;
        assert_eq!(transport.disconnects().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_connect_is_reported_as_lost() {
        let transport = LoopbackTransport::new();
        transport.refuse_connect(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = RealtimeSession::open(
            transport.clone(),
            "tok".into(),
            Arc::new(NullSurface),
            tx,
            Duration::from_secs(1),
        );
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Connecting));
        assert_eq!(next_event(&mut rx).await, RealtimeEvent::State(ConnectionState::Disconnected));
        assert!(matches!(next_event(&mut rx).await, RealtimeEvent::Lost { .. }));
        session.close().await;
        assert!(transport.disconnects().is_empty());
    }
}
