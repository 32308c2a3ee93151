//! End-to-end tests: a real `RpcClient` against a `Server` behind an
//! in-process UNIX domain socket, exercising the full stack from
//! convenience method to handler and back.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;

use virtrpc::{
    Error, ErrorCode, GuestConfig, HostConfig, Method, RpcClient, Server,
};

// =============================================================================
// Harness
// =============================================================================

struct Rig {
    client: RpcClient,
    server: Arc<Server>,
    _workdir: tempfile::TempDir,
    workdir_path: PathBuf,
}

/// Starts a server on a fresh socket and an accept loop that serves every
/// connection, mimicking the persistent channel surviving host reconnects.
async fn rig() -> Rig {
    let workdir = tempfile::tempdir().unwrap();
    let workdir_path = workdir.path().to_path_buf();
    let socket_path = workdir.path().join("channel.sock");

    let config = GuestConfig::new("/dev/null")
        .with_allowed_paths([workdir.path().to_path_buf()])
        .with_allowed_commands(["echo", "sleep", "cat"]);
    let server = Arc::new(Server::new(config).unwrap());

    let listener = UnixListener::bind(&socket_path).unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = server.serve_stream(stream).await;
            }
        });
    }

    let mut host_config = HostConfig::new(&socket_path);
    host_config.retry_interval = Duration::from_millis(100);
    Rig {
        client: RpcClient::new(host_config),
        server,
        _workdir: workdir,
        workdir_path,
    }
}

// =============================================================================
// Basic Round Trips
// =============================================================================

#[tokio::test]
async fn ping_round_trip() {
    let rig = rig().await;
    rig.client.connect().await.unwrap();
    rig.client.ping().await.unwrap();
    rig.server.stop();
}

#[tokio::test]
async fn connect_is_idempotent() {
    let rig = rig().await;
    rig.client.connect().await.unwrap();
    rig.client.connect().await.unwrap();
    rig.client.ping().await.unwrap();
}

#[tokio::test]
async fn connect_refused_on_absent_socket() {
    let config = HostConfig::new("/tmp/definitely-not-a-virtrpc-socket.sock")
        .with_max_retries(0);
    let client = RpcClient::new(config);
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionRefused { .. }));
}

#[tokio::test]
async fn system_info_end_to_end() {
    let rig = rig().await;
    let info = rig.client.system_info().await.unwrap();
    assert!(info["cpu_count"].as_u64().unwrap() >= 1);
    assert!(info["hostname"].is_string());
}

#[tokio::test]
async fn exec_streams_output_back() {
    let rig = rig().await;
    let result = rig
        .client
        .exec_command("echo end to end", 10, None, None)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "end to end\n");
    assert!(!result.truncated);
}

// =============================================================================
// Envelope Errors Are Not Retried
// =============================================================================

#[tokio::test]
async fn remote_error_surfaces_without_retry() {
    let rig = rig().await;
    let started = std::time::Instant::now();
    let err = rig
        .client
        .exec_command("rm -rf /", 10, None, None)
        .await
        .unwrap_err();

    let Error::Remote { code, message, .. } = err else {
        panic!("expected remote error, got {err}");
    };
    assert_eq!(code, ErrorCode::InvalidParams);
    assert!(message.contains("rm"));
    // No backoff sleeps happened.
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn unknown_endpoint_maps_to_3001() {
    let rig = rig().await;
    let err = rig
        .client
        .request(Method::Get, "/api/v1/nope", None, None)
        .await
        .unwrap_err();
    let Error::Remote { code, .. } = err else {
        panic!("expected remote error");
    };
    assert_eq!(code, ErrorCode::EndpointNotFound);
}

// =============================================================================
// File Transfer
// =============================================================================

#[tokio::test]
async fn upload_then_download_small_file() {
    let rig = rig().await;
    let local = rig.workdir_path.join("local-src.txt");
    let fetched = rig.workdir_path.join("fetched.txt");
    let remote = rig.workdir_path.join("remote.txt");
    tokio::fs::write(&local, b"small payload").await.unwrap();

    let up = rig
        .client
        .upload_file(&local, remote.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(up.size, 13);

    let down = rig
        .client
        .download_file(remote.to_str().unwrap(), &fetched)
        .await
        .unwrap();
    assert_eq!(down.md5, up.md5);
    assert_eq!(
        tokio::fs::read(&fetched).await.unwrap(),
        b"small payload"
    );
}

#[tokio::test]
async fn upload_is_idempotent_for_identical_content() {
    let rig = rig().await;
    let local = rig.workdir_path.join("src.bin");
    let remote = rig.workdir_path.join("dst.bin");
    tokio::fs::write(&local, vec![7u8; 4096]).await.unwrap();

    let first = rig
        .client
        .upload_file(&local, remote.to_str().unwrap())
        .await
        .unwrap();
    let second = rig
        .client
        .upload_file(&local, remote.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(first.md5, second.md5);
}

#[tokio::test]
async fn chunked_transfer_round_trip() {
    let rig = rig().await;
    // Big enough to force several chunks in both directions.
    let payload: Vec<u8> = (0..1_500_000u32).map(|i| (i % 253) as u8).collect();
    let local = rig.workdir_path.join("big-src.bin");
    let fetched = rig.workdir_path.join("big-fetched.bin");
    let remote = rig.workdir_path.join("big-remote.bin");
    tokio::fs::write(&local, &payload).await.unwrap();

    let up = rig
        .client
        .chunked_upload_file(&local, remote.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(up.size, payload.len() as u64);

    let down = rig
        .client
        .download_file(remote.to_str().unwrap(), &fetched)
        .await
        .unwrap();
    assert_eq!(down.size, payload.len() as u64);
    assert_eq!(down.md5, up.md5);
    assert_eq!(tokio::fs::read(&fetched).await.unwrap(), payload);
}

#[tokio::test]
async fn download_missing_remote_is_file_not_found() {
    let rig = rig().await;
    let err = rig
        .client
        .download_file(
            rig.workdir_path.join("ghost.bin").to_str().unwrap(),
            &rig.workdir_path.join("out.bin"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FileNotFound(_)));
}

#[tokio::test]
async fn file_info_reports_upload() {
    let rig = rig().await;
    let local = rig.workdir_path.join("meta-src");
    let remote = rig.workdir_path.join("meta-dst");
    tokio::fs::write(&local, b"metadata check").await.unwrap();

    let up = rig
        .client
        .upload_file(&local, remote.to_str().unwrap())
        .await
        .unwrap();
    let info = rig.client.file_info(remote.to_str().unwrap()).await.unwrap();

    assert_eq!(info["exists"], true);
    assert_eq!(info["type"], "file");
    assert_eq!(info["size"].as_u64().unwrap(), up.size);
    assert_eq!(info["md5"].as_str().unwrap(), up.md5);
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn client_survives_dropped_connection() {
    // An accept loop that kills the first connection on arrival, then
    // serves normally: the guest restarting mid-session.
    let workdir = tempfile::tempdir().unwrap();
    let socket_path = workdir.path().join("flaky.sock");
    let server = Arc::new(Server::new(GuestConfig::new("/dev/null")).unwrap());

    let listener = UnixListener::bind(&socket_path).unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let server = Arc::clone(&server);
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if accepted.fetch_add(1, Ordering::SeqCst) == 0 {
                    drop(stream);
                    continue;
                }
                let _ = server.serve_stream(stream).await;
            }
        });
    }

    let mut config = HostConfig::new(&socket_path);
    config.retry_interval = Duration::from_millis(50);
    let client = RpcClient::new(config);

    client.ping().await.expect("retry should recover");
    assert!(accepted.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn no_auto_reconnect_fails_after_disconnect() {
    let rig = rig().await;
    // Rebuild the client with reconnect disabled but the same socket.
    let mut config = HostConfig::new(rig.workdir_path.join("channel.sock"))
        .with_auto_reconnect(false);
    config.retry_interval = Duration::from_millis(50);
    let client = RpcClient::new(config);

    client.connect().await.unwrap();
    client.ping().await.unwrap();
    client.disconnect().await;

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, Error::NotConnected), "got {err}");
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_callers_are_serialized() {
    let rig = rig().await;
    let client = Arc::new(rig.client);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move { client.ping().await }));
    }
    for task in tasks {
        task.await.unwrap().expect("each serialized ping succeeds");
    }
}
