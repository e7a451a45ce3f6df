//! HTTP API tests over a real listener.

use dockvm::api::state::ApiState;
use dockvm::config::Timings;
use dockvm::control::ControlChannel;
use dockvm::storage::{InitOptions, VmLayout};
use dockvm::vm::{Resources, SupervisorOptions};
use dockvm::Supervisor;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn supervisor(dir: &Path) -> Arc<Supervisor> {
    let vm = dir.join("qemu-system-x86_64");
    std::fs::write(&vm, "#!/bin/sh\necho console-ready\nexec sleep 60\n").unwrap();
    std::fs::set_permissions(&vm, std::fs::Permissions::from_mode(0o755)).unwrap();
    let iso = dir.join("alpine.iso");
    std::fs::write(&iso, b"iso").unwrap();

    Arc::new(Supervisor::new(SupervisorOptions {
        init: InitOptions {
            disk_size_mb: 8,
            boot_media_source: Some(iso),
            qemu_img: Some(dir.join("missing-qemu-img")),
        },
        qemu_binary: Some(vm),
        timings: Timings {
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(1),
            stop_poll: Duration::from_millis(20),
            restart_settle: Duration::from_millis(50),
            command_timeout: Duration::from_secs(1),
        },
        channel: ControlChannel::new(Vec::new()),
        ..SupervisorOptions::new(VmLayout::new(dir.join("state")))
    }))
}

async fn serve(supervisor: Arc<Supervisor>) -> SocketAddr {
    let state = Arc::new(ApiState::new(
        supervisor,
        Resources::new(1024, 1),
        Duration::from_secs(1),
    ));
    let app = dockvm::api::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Minimal HTTP/1.1 client: returns (status code, body).
async fn request(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let body = body.unwrap_or("");
    let req = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8_lossy(&raw).into_owned();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn health() {
    let dir = tempfile::tempdir().unwrap();
    let addr = serve(supervisor(dir.path())).await;

    let (status, body) = request(addr, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""status":"ok""#));
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path());
    let addr = serve(supervisor.clone()).await;

    let (status, body) = request(addr, "GET", "/api/v1/vm", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""phase":"stopped""#));

    // Not initialized yet.
    let (status, _) = request(addr, "POST", "/api/v1/vm/start", None).await;
    assert_eq!(status, 409);

    let (status, _) = request(addr, "POST", "/api/v1/vm/initialize", None).await;
    assert_eq!(status, 200);

    let (status, body) = request(
        addr,
        "POST",
        "/api/v1/vm/start",
        Some(r#"{"ram_mb": 100, "cpus": 2}"#),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body.contains("BAD_REQUEST"));

    let (status, body) = request(
        addr,
        "POST",
        "/api/v1/vm/start",
        Some(r#"{"ram_mb": 1024}"#),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""phase":"running""#));

    // No transports configured: the VM is unreachable but keeps running.
    let (status, _) = request(
        addr,
        "POST",
        "/api/v1/vm/exec",
        Some(r#"{"command": "info status"}"#),
    )
    .await;
    assert_eq!(status, 503);

    let (status, _) = request(addr, "POST", "/api/v1/vm/exec", Some(r#"{"command": "  "}"#)).await;
    assert_eq!(status, 400);

    let (status, body) = request(addr, "POST", "/api/v1/vm/stop", None).await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""phase":"stopped""#));

    let (status, body) = request(addr, "GET", "/api/v1/vm/logs?lines=5", None).await;
    assert_eq!(status, 200);
    assert!(body.contains("console-ready"));

    let (status, _) = request(
        addr,
        "POST",
        "/api/v1/vm/exec",
        Some(r#"{"command": "info status"}"#),
    )
    .await;
    assert_eq!(status, 409);
}

#[tokio::test(flavor = "multi_thread")]
async fn events_reject_unknown_kind() {
    let dir = tempfile::tempdir().unwrap();
    let addr = serve(supervisor(dir.path())).await;

    let (status, _) = request(addr, "GET", "/api/v1/vm/events?kind=metrics", None).await;
    assert_eq!(status, 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_rejects_oversized_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let addr = serve(supervisor(dir.path())).await;

    let (status, body) = request(
        addr,
        "POST",
        "/api/v1/vm/exec",
        Some(r#"{"command": "info status", "timeout_secs": 18446744073709551615}"#),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body.contains("timeout_secs"));
}
