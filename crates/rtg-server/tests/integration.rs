//! End-to-end tests using a real WebSocket client.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use rtg_server::websocket::handler::EchoHandler;
use rtg_server::{GatewayServer, Limits, ServerConfig, ServerError};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_limits() -> Limits {
    Limits {
        max_message_bytes: 1024,
        ping_interval: Duration::from_secs(25),
        pong_wait: Duration::from_secs(60),
        write_timeout: Duration::from_secs(1),
        close_grace: Duration::from_secs(2),
    }
}

/// Boot a test server and return the WS URL + server.
async fn boot_server(limits: Limits, allowed_origins: Vec<String>) -> (String, Arc<GatewayServer>) {
    let config = ServerConfig {
        allowed_origins,
        ..ServerConfig::default()
    };
    boot_with_config(config, limits).await
}

async fn boot_with_config(config: ServerConfig, limits: Limits) -> (String, Arc<GatewayServer>) {
    let server = Arc::new(GatewayServer::new(config, limits, Arc::new(EchoHandler)));
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), server)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _resp) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

/// Next text or binary frame, skipping control frames.
async fn next_data(ws: &mut WsStream) -> Option<Message> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.ok()?? {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => return Some(msg),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Poll `check` until it holds or the timeout elapses.
async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Keep reading until the server ends the connection (answers close frames).
fn spawn_reader(mut ws: WsStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} })
}

#[tokio::test]
async fn echo_round_trip() {
    let (url, server) = boot_server(test_limits(), Vec::new()).await;
    let mut ws = connect(&url).await;

    let start = Instant::now();
    ws.send(Message::Text("0123456789".into())).await.unwrap();
    let reply = next_data(&mut ws).await.unwrap();
    assert!(start.elapsed() < server.limits().write_timeout);
    assert_eq!(reply, Message::Text("0123456789".into()));

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    assert_eq!(next_data(&mut ws).await.unwrap(), Message::Binary(vec![1u8, 2, 3].into()));
}

#[tokio::test]
async fn size_limit_boundary() {
    let limits = test_limits();
    let max = limits.max_message_bytes;
    let (url, server) = boot_server(limits, Vec::new()).await;
    let mut ws = connect(&url).await;

    // Exactly the limit is accepted.
    let at_limit = "a".repeat(max);
    ws.send(Message::Text(at_limit.clone().into())).await.unwrap();
    assert_eq!(next_data(&mut ws).await.unwrap(), Message::Text(at_limit.into()));

    // Over the limit closes the session without an echo.
    ws.send(Message::Text("b".repeat(max + 100).into())).await.unwrap();
    loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason.as_str(), "message too large");
                break;
            }
            Some(Ok(Message::Close(None))) => panic!("close frame carried no status code"),
            Some(Ok(Message::Text(_) | Message::Binary(_))) => panic!("oversized message was echoed"),
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("connection failed before close frame: {e}"),
            None => panic!("stream ended before close frame"),
        }
    }

    let registry = server.registry().clone();
    assert!(eventually(|| { let r = registry.clone(); async move { r.is_empty().await } }).await);
    let snap = server.metrics().snapshot();
    assert_eq!(snap.disconnects, 1);
    assert_eq!(snap.messages_in, 1);
}

#[tokio::test]
async fn silent_client_closed_by_heartbeat() {
    let limits = Limits {
        ping_interval: Duration::from_millis(100),
        pong_wait: Duration::from_millis(300),
        ..test_limits()
    };
    let (url, server) = boot_server(limits, Vec::new()).await;

    // Never read, so the client never answers pings.
    let _ws = connect(&url).await;
    let start = Instant::now();
    let registry = server.registry().clone();
    assert!(eventually(|| { let r = registry.clone(); async move { r.len().await == 1 } }).await);

    assert!(eventually(|| { let r = registry.clone(); async move { r.is_empty().await } }).await);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "closed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "closed too late: {elapsed:?}");
    assert_eq!(server.metrics().snapshot().current, 0);
}

#[tokio::test]
async fn responsive_client_survives_heartbeat() {
    let limits = Limits {
        ping_interval: Duration::from_millis(100),
        pong_wait: Duration::from_millis(300),
        ..test_limits()
    };
    let (url, server) = boot_server(limits, Vec::new()).await;

    // Reading answers pings automatically.
    let reader = spawn_reader(connect(&url).await);
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(server.registry().len().await, 1);
    assert_eq!(server.metrics().snapshot().disconnects, 0);

    let report = server.shutdown().await.unwrap();
    assert_eq!(report.forced, 0);
    timeout(TIMEOUT, reader).await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_closes_all_sessions_within_grace() {
    let (url, server) = boot_server(test_limits(), Vec::new()).await;

    let reader_a = spawn_reader(connect(&url).await);
    let reader_b = spawn_reader(connect(&url).await);
    // Never reads, so never acknowledges the close frame.
    let _silent = connect(&url).await;

    let registry = server.registry().clone();
    assert!(eventually(|| { let r = registry.clone(); async move { r.len().await == 3 } }).await);

    let start = Instant::now();
    let report = server.shutdown().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(2_100), "shutdown took {elapsed:?}");

    assert_eq!(report.sessions, 3);
    assert_eq!(report.graceful, 2);
    assert_eq!(report.forced, 1);
    assert_eq!(report.failed, 0);
    assert!(server.registry().is_empty().await);

    let snap = server.metrics().snapshot();
    assert_eq!(snap.accepted, 3);
    assert_eq!(snap.accepted, snap.disconnects);
    assert_eq!(snap.current, 0);

    timeout(TIMEOUT, reader_a).await.unwrap().unwrap();
    timeout(TIMEOUT, reader_b).await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (url, server) = boot_server(test_limits(), Vec::new()).await;
    let _ = server.shutdown().await.unwrap();
    assert!(server.shutdown().await.is_none());

    let refused = eventually(|| {
        let url = url.clone();
        async move { connect_async(url.as_str()).await.is_err() }
    })
    .await;
    assert!(refused);
    assert_eq!(server.metrics().snapshot().accepted, 0);
}

#[tokio::test]
async fn metrics_stay_consistent() {
    let (url, server) = boot_server(test_limits(), Vec::new()).await;

    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    for ws in [&mut a, &mut b] {
        ws.send(Message::Text("ping".into())).await.unwrap();
        assert!(next_data(ws).await.is_some());
    }
    a.send(Message::Text("again".into())).await.unwrap();
    assert!(next_data(&mut a).await.is_some());

    let metrics = server.metrics().clone();
    assert!(eventually(|| {
        let m = metrics.clone();
        async move {
            let s = m.snapshot();
            s.messages_in == 3 && s.messages_out == 3
        }
    })
    .await);
    let snap = metrics.snapshot();
    assert_eq!(snap.accepted, 2);
    assert_eq!(snap.current, 2);

    a.close(None).await.unwrap();
    assert!(eventually(|| { let m = metrics.clone(); async move { m.snapshot().disconnects == 1 } }).await);
    let snap = metrics.snapshot();
    assert_eq!(snap.current, snap.accepted - snap.disconnects);
    assert_eq!(snap.current, 1);

    let _ = server.shutdown().await.unwrap();
    drop(b);
    assert!(eventually(|| { let m = metrics.clone(); async move { m.snapshot().current == 0 } }).await);
    let snap = metrics.snapshot();
    assert_eq!(snap.accepted, snap.disconnects);
}

#[tokio::test]
async fn origin_allow_list_enforced() {
    let (url, server) = boot_server(test_limits(), vec!["https://app.example".into()]).await;

    let mut bad = url.as_str().into_client_request().unwrap();
    let _ = bad
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://evil.example"));
    match connect_async(bad).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 403),
        Err(e) => panic!("expected 403, got {e}"),
        Ok(_) => panic!("expected 403, upgrade succeeded"),
    }

    let mut good = url.as_str().into_client_request().unwrap();
    let _ = good
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://app.example"));
    let (mut ws, _) = connect_async(good).await.unwrap();
    ws.send(Message::Text("hi".into())).await.unwrap();
    assert_eq!(next_data(&mut ws).await.unwrap(), Message::Text("hi".into()));

    // Non-browser clients send no Origin header.
    let _plain = connect(&url).await;
    let metrics = server.metrics().clone();
    assert!(eventually(|| { let m = metrics.clone(); async move { m.snapshot().accepted == 2 } }).await);
}

#[tokio::test]
async fn health_endpoint_over_http() {
    let (url, _server) = boot_server(test_limits(), Vec::new()).await;
    let addr = url.trim_start_matches("ws://").trim_end_matches("/ws").to_string();

    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let request = format!("GET /healthz HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes()).await.unwrap();
    let mut response = String::new();
    let _ = tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
}

#[tokio::test]
async fn slow_request_headers_are_cut_off() {
    let config = ServerConfig {
        read_header_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let (url, _server) = boot_with_config(config, test_limits()).await;
    let addr = url.trim_start_matches("ws://").trim_end_matches("/ws").to_string();

    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let partial = format!("GET /healthz HTTP/1.1\r\nHost: {addr}\r\n");
    tokio::io::AsyncWriteExt::write_all(&mut stream, partial.as_bytes()).await.unwrap();

    let started = Instant::now();
    let mut response = Vec::new();
    // EOF or reset both mean the server dropped the connection.
    let _ = timeout(TIMEOUT, tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response))
        .await
        .expect("server kept a connection with incomplete headers open");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "closed too early: {elapsed:?}");
    assert!(!String::from_utf8_lossy(&response).contains("200 OK"));
}

#[tokio::test]
async fn listen_rejects_invalid_limits() {
    let limits = Limits {
        ping_interval: Duration::ZERO,
        ..test_limits()
    };
    let server = GatewayServer::new(ServerConfig::default(), limits, Arc::new(EchoHandler));
    let err = server.listen().await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidConfig(_)), "unexpected error: {err}");
}
