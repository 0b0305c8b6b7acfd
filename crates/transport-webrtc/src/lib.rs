//! Receive-only WebRTC media transport with WHEP-style HTTP signaling.
//!
//! The session token from a telescope lease is the bearer credential for the
//! media server. One POST carries the complete offer (ICE gathered up front),
//! the answer comes back in the body, and the `Location` header names the
//! resource to DELETE when the viewer leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use scope_session::{
    MediaTrack, RealtimeTransport, TrackKind, TransportError, TransportEvent, TransportHandle,
    TransportLink,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum WhepError {
    #[error("webrtc setup failed: {0}")]
    Setup(String),
    #[error("media server answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("media server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid media endpoint: {0}")]
    Url(String),
    #[error("peer connection ended as {0} before connecting")]
    PeerEnded(String),
    #[error("peer connection not established within {0:?}")]
    Timeout(Duration),
}

impl From<WhepError> for TransportError {
    fn from(err: WhepError) -> Self {
        match err {
            WhepError::Timeout(_) => TransportError::Timeout,
            WhepError::Rejected { .. } | WhepError::Http(_) | WhepError::Url(_) => {
                TransportError::Signaling(err.to_string())
            }
            WhepError::Setup(_) | WhepError::PeerEnded(_) => TransportError::Connect(err.to_string()),
        }
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> WhepError {
    WhepError::Setup(err.to_string())
}

#[derive(Debug, Clone)]
pub struct WhepConfig {
    pub endpoint: Url,
    pub ice_servers: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl WhepConfig {
    pub fn new(endpoint: &str) -> Result<Self, WhepError> {
        let endpoint =
            Url::parse(endpoint).map_err(|err| WhepError::Url(format!("{endpoint}: {err}")))?;
        Ok(Self {
            endpoint,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
        })
    }
}

/// Turns peer connection states into transport events. The peer retries ICE
/// on its own; only `Failed` and `Closed` end the link.
#[derive(Debug, Default)]
struct PeerStateMapper {
    connected_once: bool,
    reconnecting: bool,
    finished: bool,
}

impl PeerStateMapper {
    fn observe(&mut self, state: RTCPeerConnectionState) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        match state {
            RTCPeerConnectionState::Connected if !self.connected_once => {
                self.connected_once = true;
                Some(TransportEvent::Connected)
            }
            RTCPeerConnectionState::Connected if self.reconnecting => {
                self.reconnecting = false;
                Some(TransportEvent::Reconnected)
            }
            RTCPeerConnectionState::Disconnected if self.connected_once && !self.reconnecting => {
                self.reconnecting = true;
                Some(TransportEvent::Reconnecting)
            }
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                self.finished = true;
                Some(TransportEvent::Disconnected {
                    reason: format!("peer connection {state}"),
                })
            }
            _ => None,
        }
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Audio => Some(TrackKind::Audio),
        _ => None,
    }
}

/// The WHEP resource may come back relative to the endpoint.
fn resolve_resource(endpoint: &Url, location: Option<&str>) -> Option<Url> {
    let location = location?.trim();
    if location.is_empty() {
        return None;
    }
    endpoint.join(location).ok()
}

struct WhepSession {
    peer: Arc<RTCPeerConnection>,
    resource: Option<Url>,
    token: String,
}

pub struct WhepTransport {
    config: WhepConfig,
    api: API,
    http: reqwest::Client,
    next_handle: AtomicU64,
    sessions: Mutex<HashMap<u64, WhepSession>>,
}

impl WhepTransport {
    pub fn new(config: WhepConfig) -> Result<Self, WhepError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_setup_error)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            api,
            http,
            next_handle: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let urls: Vec<String> = self
            .config
            .ice_servers
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn establish(&self, token: &str) -> Result<TransportLink, WhepError> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );
        match self.negotiate(peer.clone(), token).await {
            Ok(link) => Ok(link),
            Err(err) => {
                if let Err(close_err) = peer.close().await {
                    debug!(target = "rtc.whep", error = %close_err, "closing failed peer");
                }
                Err(err)
            }
        }
    }

    async fn negotiate(
        &self,
        peer: Arc<RTCPeerConnection>,
        token: &str,
    ) -> Result<TransportLink, WhepError> {
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(to_setup_error)?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(RTCPeerConnectionState::New);
        let mapper = Arc::new(Mutex::new(PeerStateMapper::default()));
        {
            let events_tx = events_tx.clone();
            peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(target = "rtc.whep", state = %state, "peer connection state changed");
                state_tx.send_replace(state);
                if let Some(event) = mapper.lock().observe(state) {
                    let _ = events_tx.send(event);
                }
                Box::pin(async {})
            }));
        }
        {
            let events_tx = events_tx.clone();
            peer.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let Some(kind) = track_kind(track.kind()) else {
                        return;
                    };
                    let id = track.id();
                    info!(target = "rtc.whep", track = %id, ?kind, "remote track received");
                    let _ = events_tx.send(TransportEvent::TrackReceived(MediaTrack { id, kind }));
                    // Rendering is someone else's job; keep the receiver flowing.
                    tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                })
            }));
        }

        let offer = peer.create_offer(None).await.map_err(to_setup_error)?;
        let mut gathered = peer.gathering_complete_promise().await;
        peer.set_local_description(offer)
            .await
            .map_err(to_setup_error)?;
        let _ = gathered.recv().await;
        let local = peer
            .local_description()
            .await
            .ok_or_else(|| WhepError::Setup("missing local description".into()))?;

        let response = self
            .http
            .post(self.config.endpoint.clone())
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/sdp")
            .body(local.sdp)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WhepError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let resource = resolve_resource(
            &self.config.endpoint,
            response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok()),
        );
        let answer = response.text().await?;
        let answer = RTCSessionDescription::answer(answer).map_err(to_setup_error)?;
        peer.set_remote_description(answer)
            .await
            .map_err(to_setup_error)?;

        let wait = state_rx.wait_for(|state| {
            matches!(
                state,
                RTCPeerConnectionState::Connected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            )
        });
        let reached = match tokio::time::timeout(self.config.connect_timeout, wait).await {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => Some(RTCPeerConnectionState::Closed),
            Err(_) => None,
        };
        let Some(reached) = reached else {
            self.delete_resource(resource.as_ref(), token).await;
            return Err(WhepError::Timeout(self.config.connect_timeout));
        };
        if reached != RTCPeerConnectionState::Connected {
            self.delete_resource(resource.as_ref(), token).await;
            return Err(WhepError::PeerEnded(reached.to_string()));
        }

        let handle = TransportHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().insert(
            handle.0,
            WhepSession {
                peer,
                resource,
                token: token.to_string(),
            },
        );
        info!(target = "rtc.whep", handle = handle.0, "media session established");
        Ok(TransportLink {
            handle,
            events: events_rx,
        })
    }

    async fn delete_resource(&self, resource: Option<&Url>, token: &str) {
        let Some(resource) = resource else {
            return;
        };
        match self
            .http
            .delete(resource.clone())
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(target = "rtc.whep", %resource, "media resource deleted");
            }
            Ok(response) => {
                warn!(target = "rtc.whep", %resource, status = %response.status(), "media resource delete refused");
            }
            Err(err) => {
                warn!(target = "rtc.whep", %resource, error = %err, "media resource delete failed");
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for WhepTransport {
    async fn connect(&self, token: &str) -> Result<TransportLink, TransportError> {
        debug!(target = "rtc.whep", endpoint = %self.config.endpoint, "connecting media session");
        self.establish(token).await.map_err(|err| {
            warn!(target = "rtc.whep", error = %err, "media session failed");
            TransportError::from(err)
        })
    }

    async fn disconnect(&self, handle: TransportHandle) {
        let session = self.sessions.lock().remove(&handle.0);
        let Some(session) = session else {
            return;
        };
        if let Err(err) = session.peer.close().await {
            warn!(target = "rtc.whep", handle = handle.0, error = %err, "peer close failed");
        }
        self.delete_resource(session.resource.as_ref(), &session.token)
            .await;
        info!(target = "rtc.whep", handle = handle.0, "media session closed");
    }
}
