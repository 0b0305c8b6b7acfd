use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use scope_session::{RealtimeTransport, TransportError};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use transport_webrtc::{WhepConfig, WhepTransport};

#[derive(Debug, Clone)]
struct Offer {
    authorization: Option<String>,
    content_type: Option<String>,
    sdp: String,
}

#[derive(Clone, Default)]
struct MediaServer {
    offers: Arc<Mutex<Vec<Offer>>>,
}

async fn reject_offer(
    State(server): State<MediaServer>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, &'static str) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    server.offers.lock().await.push(Offer {
        authorization: header("authorization"),
        content_type: header("content-type"),
        sdp: body,
    });
    (StatusCode::UNAUTHORIZED, "stream token expired")
}

async fn spawn_media_server() -> (String, MediaServer) {
    let server = MediaServer::default();
    let router = Router::new()
        .route("/whep", post(reject_offer))
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind media listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("http://{addr}/whep"), server)
}

fn offline_config(endpoint: &str) -> WhepConfig {
    let mut config = WhepConfig::new(endpoint).expect("endpoint parses");
    config.ice_servers.clear();
    config.connect_timeout = Duration::from_secs(2);
    config.request_timeout = Duration::from_secs(2);
    config
}

#[test_timeout::tokio_timeout_test(30)]
async fn rejected_offer_surfaces_as_signaling_error() {
    let (endpoint, server) = spawn_media_server().await;
    let transport = WhepTransport::new(offline_config(&endpoint)).expect("transport builds");

    let err = match transport.connect("session-token-1").await {
        Ok(_) => panic!("media server rejected the offer"),
        Err(err) => err,
    };
    match err {
        TransportError::Signaling(message) => {
            assert!(message.contains("401"), "{message}");
            assert!(message.contains("stream token expired"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let offers = server.offers.lock().await.clone();
    assert_eq!(offers.len(), 1);
    let offer = &offers[0];
    assert_eq!(
        offer.authorization.as_deref(),
        Some("Bearer session-token-1")
    );
    assert_eq!(offer.content_type.as_deref(), Some("application/sdp"));
    assert!(offer.sdp.starts_with("v=0"));
    assert!(offer.sdp.contains("m=video"));
    assert!(offer.sdp.contains("a=recvonly"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn unreachable_media_server_is_a_signaling_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let transport =
        WhepTransport::new(offline_config(&format!("http://{addr}/whep"))).expect("builds");
    let result = transport.connect("session-token-2").await;
    assert!(matches!(result, Err(TransportError::Signaling(_))));
}
