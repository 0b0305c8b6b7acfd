use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use scope_registry::{
    ControlMessage, ErrorKind, Interests, RegistryClient, RegistryError, ResourceRegistry,
    TelescopeStatus,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct Backend {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Backend {
    async fn record(&self, path: String, body: Value) {
        self.requests.lock().await.push((path, body));
    }

    async fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().await.clone()
    }
}

async fn list() -> Json<Value> {
    Json(json!({
        "available_telescopes": 1,
        "reserved_telescopes": 1,
        "unavailable_telescopes": 0,
        "telescopes": [
            {
                "telescope_id": "T1",
                "telescope_name": "Kraków North",
                "price_per_minute": 0.5,
                "location": {"city": "Kraków", "country": "Poland", "latitude": 50.06, "longitude": 19.94},
                "status": "FREE"
            },
            {
                "telescope_id": "T2",
                "telescope_name": "Zakopane Ridge",
                "price_per_minute": 0.8,
                "location": {"latitude": 49.3, "longitude": 19.95},
                "status": "LOCK"
            }
        ]
    }))
}

async fn details(Path(id): Path<String>) -> impl IntoResponse {
    if id != "T1" {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "not found"}))).into_response();
    }
    Json(json!({
        "aperture": 254.0,
        "focal_length": 1200.0,
        "focal_ratio": 4.7,
        "weight": 21.0,
        "length": 1145.0,
        "width": 300.0,
        "height": 300.0,
        "mount_type": "DOBSONIAN",
        "optical_design": "Reflector"
    }))
    .into_response()
}

async fn set_status(
    State(backend): State<Backend>,
    Path((holder, id, status)): Path<(String, String, String)>,
) -> impl IntoResponse {
    backend
        .record(format!("{holder}/{id}/{status}"), Value::Null)
        .await;
    match (id.as_str(), status.as_str()) {
        ("T1", "LOCK") => Json(json!({"subscribe_token": "tok-123"})).into_response(),
        ("T2", "LOCK") => (StatusCode::CONFLICT, "telescope already locked").into_response(),
        ("T5", "LOCK") => (StatusCode::SERVICE_UNAVAILABLE, "").into_response(),
        ("T6", "LOCK") => (StatusCode::OK, "{\"subscribe_token\":").into_response(),
        (_, "FREE") => StatusCode::OK.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn interests(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    backend.record(format!("interests/{id}"), body).await;
    StatusCode::OK
}

async fn control(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    backend.record(format!("control/{id}"), body).await;
    StatusCode::NO_CONTENT
}

async fn spawn_backend() -> (SocketAddr, Backend) {
    let backend = Backend::default();
    let router = Router::new()
        .route("/api/telescopes/list", get(list))
        .route("/api/telescopes/:id", get(details))
        .route("/api/telescopes/interests/:id", post(interests))
        .route("/api/telescopes/control/:id", post(control))
        .route("/api/telescopes/:id/:telescope/:status", post(set_status))
        .with_state(backend.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (addr, backend)
}

fn client_for(addr: SocketAddr) -> RegistryClient {
    RegistryClient::new(&format!("http://{addr}/api")).expect("client")
}

#[test_timeout::tokio_timeout_test(20)]
async fn lists_and_describes_telescopes() {
    let (addr, _backend) = spawn_backend().await;
    let client = client_for(addr);

    let listing = client.list().await.expect("list telescopes");
    assert_eq!(listing.telescopes.len(), 2);
    assert_eq!(listing.find("T2").unwrap().status, TelescopeStatus::Locked);
    assert_eq!(listing.find("T2").unwrap().location.city, None);

    let specs = client.details("T1").await.expect("details");
    assert_eq!(specs.focal_length, 1200.0);

    let err = client.details("T9").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(ref id) if id == "T9"));
}

#[test_timeout::tokio_timeout_test(20)]
async fn lock_returns_token_and_free_tolerates_empty_body() {
    let (addr, backend) = spawn_backend().await;
    let client = client_for(addr);

    let state = client
        .set_status("1", "T1", TelescopeStatus::Locked)
        .await
        .expect("lock");
    assert_eq!(state.subscribe_token, "tok-123");

    let released = client
        .set_status("1", "T1", TelescopeStatus::Free)
        .await
        .expect("free");
    assert!(released.subscribe_token.is_empty());

    let paths: Vec<String> = backend.requests().await.into_iter().map(|(p, _)| p).collect();
    assert_eq!(paths, vec!["1/T1/LOCK".to_string(), "1/T1/FREE".to_string()]);
}

#[test_timeout::tokio_timeout_test(20)]
async fn classifies_lock_failures() {
    let (addr, _backend) = spawn_backend().await;
    let client = client_for(addr);

    let conflict = client
        .set_status("1", "T2", TelescopeStatus::Locked)
        .await
        .unwrap_err();
    match &conflict {
        RegistryError::Conflict {
            telescope_id,
            reason,
        } => {
            assert_eq!(telescope_id, "T2");
            assert!(reason.contains("already locked"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(conflict.kind(), ErrorKind::Client);

    let unavailable = client
        .set_status("1", "T5", TelescopeStatus::Locked)
        .await
        .unwrap_err();
    assert_eq!(unavailable.kind(), ErrorKind::Server);
    assert!(unavailable.is_transient());

    let garbled = client
        .set_status("1", "T6", TelescopeStatus::Locked)
        .await
        .unwrap_err();
    assert!(matches!(garbled, RegistryError::Decode(_)));
}

#[test_timeout::tokio_timeout_test(20)]
async fn forwards_control_and_interest_bodies() {
    let (addr, backend) = spawn_backend().await;
    let client = client_for(addr);

    client
        .control(
            "T1",
            &ControlMessage {
                kind: "dx".into(),
                value: -0.1,
            },
        )
        .await
        .expect("control");
    client
        .publish_interests(
            "T1",
            &Interests {
                interesting: vec!["M31".into(), "Jupiter".into()],
            },
        )
        .await
        .expect("interests");

    let requests = backend.requests().await;
    assert_eq!(requests[0].0, "control/T1");
    assert_eq!(requests[0].1, json!({"type": "dx", "value": -0.1}));
    assert_eq!(requests[1].0, "interests/T1");
    assert_eq!(requests[1].1, json!({"interesting": ["M31", "Jupiter"]}));
}

#[test_timeout::tokio_timeout_test(20)]
async fn unreachable_backend_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr);
    let err = client
        .set_status("1", "T1", TelescopeStatus::Locked)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}

/// Answers LOCK with a 200 whose body is cut short and everything else with
/// an empty 200. Records each request path.
async fn spawn_truncating_backend() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let paths = Arc::new(Mutex::new(Vec::new()));
    let recorded = paths.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                let reply: &[u8] = if path.ends_with("/LOCK") {
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 200\r\n\r\n{\"subscribe_token\":\"ab"
                } else {
                    b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                };
                recorded.lock().await.push(path);
                let _ = socket.write_all(reply).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, paths)
}

#[test_timeout::tokio_timeout_test(20)]
async fn accepted_lock_with_cut_body_is_a_decode_error() {
    let (addr, paths) = spawn_truncating_backend().await;
    let client = client_for(addr);

    let err = client
        .set_status("1", "T1", TelescopeStatus::Locked)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Decode(_)), "{err:?}");
    assert!(!err.is_transient());
    assert_eq!(paths.lock().await.clone(), vec!["/api/telescopes/1/T1/LOCK".to_string()]);
}
