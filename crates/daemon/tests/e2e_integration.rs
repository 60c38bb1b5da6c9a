//! End-to-end integration tests for WebShell.
//!
//! These tests run a real server on a loopback port and verify complete flows:
//! - Health endpoints
//! - Terminal sessions over websockets, binary and legacy text
//! - Admission control rejections
//! - Graceful shutdown with live sessions

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data as OpData, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame as WsFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use webshell_daemon::config::Config;
use webshell_daemon::WebShellServer;
use webshell_protocol::{Frame, FrameCodec, FrameKind, TerminalSize};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Create a test configuration bound to an ephemeral port.
fn test_config() -> Config {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.shell.command = "/bin/sh".to_string();
    config.shutdown.timeout_secs = 5;
    config
}

async fn start_server(config: Config) -> (WebShellServer, SocketAddr) {
    let server = WebShellServer::new(config);
    let addr = server.start().await.unwrap();
    (server, addr)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws/pty", addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = connect_async(ws_url(addr)).await.unwrap();
    client
}

async fn send_frame(client: &mut Client, frame: Frame) {
    let bytes = FrameCodec::new().encode(&frame).unwrap();
    client.send(Message::Binary(bytes)).await.unwrap();
}

/// Reads terminal output until it contains `marker`.
async fn read_output_until(client: &mut Client, marker: &str) -> bool {
    let codec = FrameCodec::new();
    let mut output = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, client.next()).await {
        if let Message::Binary(bytes) = msg {
            let frame = codec.decode(&bytes).unwrap();
            if frame.kind == FrameKind::Data {
                output.push_str(&String::from_utf8_lossy(&frame.payload));
                if output.contains(marker) {
                    return true;
                }
            }
        }
    }
    false
}

/// Reads until the server closes the connection.
async fn wait_for_close(client: &mut Client) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, client.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

fn assert_rejected_with(result: Result<(Client, impl std::fmt::Debug), WsError>, status: u16) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), status),
        Err(e) => panic!("expected HTTP {status}, got error {e}"),
        Ok(_) => panic!("expected HTTP {status}, connection was accepted"),
    }
}

async fn wait_for_sessions(server: &WebShellServer, expected: usize) {
    for _ in 0..100 {
        if server.coordinator().registry().count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} sessions, have {}",
        server.coordinator().registry().count()
    );
}

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (server, addr) = start_server(test_config()).await;

    let response = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_sessions"], 0);
    assert_eq!(body["active_connections"], 0);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ready_endpoint() {
    let (server, addr) = start_server(test_config()).await;

    let response = reqwest::get(format!("http://{}/readyz", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    server.shutdown().await.unwrap();
    assert!(!server.coordinator().is_ready());
}

#[tokio::test]
async fn test_metrics_endpoint_counts_sessions() {
    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;
    wait_for_sessions(&server, 1).await;

    let response = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("webshell_sessions_active 1\n"));
    assert!(text.contains("webshell_connections_active 1\n"));
    assert!(text.contains("webshell_rate_limit_clients 1\n"));

    client.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

// =============================================================================
// Session Tests
// =============================================================================

#[tokio::test]
async fn test_binary_session_round_trip() {
    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;

    send_frame(&mut client, Frame::data(b"echo $((6*7))ok\n".to_vec())).await;
    assert!(read_output_until(&mut client, "42ok").await);

    client.close(None).await.unwrap();
    wait_for_sessions(&server, 0).await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_legacy_text_session() {
    use base64::Engine;

    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;

    let input = base64::engine::general_purpose::STANDARD.encode(b"echo $((3*3))legacy\n");
    client.send(Message::Text(input)).await.unwrap();
    assert!(read_output_until(&mut client, "9legacy").await);

    client.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resize_reaches_shell() {
    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;

    send_frame(&mut client, Frame::resize(TerminalSize::new(33, 101))).await;
    send_frame(&mut client, Frame::data(b"stty size\n".to_vec())).await;
    assert!(read_output_until(&mut client, "33 101").await);

    client.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_legacy_resize_with_non_utf8_bytes() {
    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;

    // 24x132 as a raw text frame; 0x84 makes the payload invalid UTF-8
    let resize = WsFrame::message(
        vec![0x01, 0x00, 0x18, 0x00, 0x84],
        OpCode::Data(OpData::Text),
        true,
    );
    client.send(Message::Frame(resize)).await.unwrap();
    send_frame(&mut client, Frame::data(b"stty size\n".to_vec())).await;

    assert!(read_output_until(&mut client, "24 132").await);
    assert_eq!(server.coordinator().registry().count(), 1);

    client.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_plain_request_to_socket_path_rejected() {
    let (server, addr) = start_server(test_config()).await;

    let response = reqwest::get(ws_url(addr).replace("ws://", "http://")).await.unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(server.coordinator().registry().reserved(), 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ping_frame_answered_with_pong() {
    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;

    send_frame(&mut client, Frame::ping()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut got_pong = false;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, client.next()).await {
        if msg == Message::Binary(vec![0x03]) {
            got_pong = true;
            break;
        }
    }
    assert!(got_pong);

    client.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shell_exit_closes_connection() {
    let (server, addr) = start_server(test_config()).await;
    let mut client = connect(addr).await;

    send_frame(&mut client, Frame::data(b"exit\n".to_vec())).await;
    assert!(wait_for_close(&mut client).await);
    wait_for_sessions(&server, 0).await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_frees_session_slot() {
    let mut config = test_config();
    config.limits.max_sessions = 1;
    let (server, addr) = start_server(config).await;

    let mut first = connect(addr).await;
    wait_for_sessions(&server, 1).await;
    first.close(None).await.unwrap();
    wait_for_sessions(&server, 0).await;

    let mut second = connect(addr).await;
    send_frame(&mut second, Frame::data(b"echo $((2+2))again\n".to_vec())).await;
    assert!(read_output_until(&mut second, "4again").await);

    second.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

// =============================================================================
// Admission Tests
// =============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_before_upgrade() {
    let mut config = test_config();
    config.limits.rate_per_sec = 0.01;
    config.limits.burst = 3;
    let (server, addr) = start_server(config).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(addr).await);
    }

    assert_rejected_with(connect_async(ws_url(addr)).await, 429);
    wait_for_sessions(&server, 3).await;

    for mut client in clients {
        client.close(None).await.unwrap();
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_cap_rejects() {
    let mut config = test_config();
    config.limits.max_sessions = 2;
    let (server, addr) = start_server(config).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    assert_rejected_with(connect_async(ws_url(addr)).await, 429);

    a.close(None).await.unwrap();
    b.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disallowed_origin_rejected() {
    let mut config = test_config();
    config.server.allowed_origins = vec!["https://admin.example.com".to_string()];
    let (server, addr) = start_server(config).await;

    let mut request = ws_url(addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example"));
    assert_rejected_with(connect_async(request).await, 403);

    let mut request = ws_url(addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://admin.example.com"));
    let (mut client, _) = connect_async(request).await.unwrap();

    client.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[tokio::test]
async fn test_shutdown_closes_live_sessions() {
    let (server, addr) = start_server(test_config()).await;

    let mut clients = vec![connect(addr).await, connect(addr).await];
    wait_for_sessions(&server, 2).await;

    let started = std::time::Instant::now();
    let report = server.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.sessions_cancelled, 2);
    assert_eq!(report.listeners_stopped, 1);
    assert_eq!(server.coordinator().registry().count(), 0);

    for client in &mut clients {
        assert!(wait_for_close(client).await);
    }

    // The listener is gone
    assert!(reqwest::get(format!("http://{}/healthz", addr)).await.is_err());
}
