//! Tests for the guest server loop driven over a raw in-process stream.
//!
//! These exercise the wire contract directly: literal HTTP bytes in,
//! literal HTTP bytes out, with the server running `serve_stream` on one
//! half of a socketpair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::UnixStream;

use virtrpc::handlers::{Handler, RequestContext};
use virtrpc::{
    read_response, Channel, Deadline, Error, GuestConfig, HttpRequest, Method, ResponseEnvelope,
    RouteOptions, Server,
};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    /// The host side of the socketpair; one channel for both directions,
    /// used strictly alternating like a real client.
    peer: Channel<UnixStream>,
    server: Arc<Server>,
    task: tokio::task::JoinHandle<()>,
}

async fn start(config: GuestConfig) -> Harness {
    let (host_end, guest_end) = UnixStream::pair().unwrap();
    let server = Arc::new(Server::new(config).unwrap());
    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.serve_stream(guest_end).await;
        })
    };
    Harness {
        peer: Channel::new(host_end, 8192),
        server,
        task,
    }
}

impl Harness {
    async fn send_raw(&mut self, bytes: &[u8]) {
        self.peer.write_all(bytes, Deadline::none()).await.unwrap();
    }

    async fn send(&mut self, request: &HttpRequest) {
        let bytes = request.to_bytes();
        self.send_raw(&bytes).await;
    }

    async fn recv(&mut self) -> (u16, Option<String>, ResponseEnvelope) {
        let response = read_response(
            &mut self.peer,
            usize::MAX,
            Deadline::after(Duration::from_secs(10)),
        )
        .await
        .unwrap();
        let request_id = response
            .headers
            .get("X-Request-ID")
            .map(ToString::to_string);
        let envelope = ResponseEnvelope::from_http(&response).unwrap();
        (response.status, request_id, envelope)
    }
}

fn test_config() -> GuestConfig {
    GuestConfig::new("/dev/null")
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn ping_echoes_request_id() {
    let mut h = start(test_config()).await;

    h.send_raw(b"GET /api/v1/ping HTTP/1.1\r\nContent-Length: 0\r\nX-Request-ID: r1\r\n\r\n")
        .await;
    let (status, request_id, envelope) = h.recv().await;

    assert_eq!(status, 200);
    assert_eq!(request_id.as_deref(), Some("r1"));
    assert_eq!(envelope.code, 0);
    assert_eq!(envelope.message, "pong");
    assert_eq!(envelope.version, "1.0");
    assert!(envelope.data["timestamp"].as_i64().unwrap() > 0);
    assert!(envelope.data["uptime"].as_u64().is_some());
    assert!(envelope.timestamp > 0);

    h.server.stop();
    let _ = h.task.await;
}

#[tokio::test]
async fn unknown_endpoint_is_404_with_3001() {
    let mut h = start(test_config()).await;

    h.send(&HttpRequest::new(Method::Get, "/api/v1/nope")).await;
    let (status, _, envelope) = h.recv().await;

    assert_eq!(status, 404);
    assert_eq!(envelope.code, 3001);
    assert!(envelope.message.contains("endpoint not found"));

    h.server.stop();
    let _ = h.task.await;
}

#[tokio::test]
async fn disallowed_command_is_2001_with_detail() {
    let mut h = start(test_config()).await;

    let req = HttpRequest::new(Method::Post, "/api/v1/shell/exec")
        .with_json_body(br#"{"command":"rm -rf /"}"#.to_vec());
    h.send(&req).await;
    let (status, _, envelope) = h.recv().await;

    assert_eq!(status, 400);
    assert_eq!(envelope.code, 2001);
    assert_eq!(envelope.data["error_type"], "INVALID_PARAMS");
    assert!(envelope.data["detail"]
        .as_str()
        .unwrap()
        .contains("command not allowed: rm"));

    h.server.stop();
    let _ = h.task.await;
}

#[tokio::test]
async fn overrunning_handler_yields_1002_within_grace() {
    let config = test_config().with_allowed_commands(["sleep"]);
    let mut h = start(config).await;

    let started = std::time::Instant::now();
    let req = HttpRequest::new(Method::Post, "/api/v1/shell/exec")
        .with_json_body(br#"{"command":"sleep 10","timeout":1}"#.to_vec());
    h.send(&req).await;
    let (status, _, envelope) = h.recv().await;

    assert_eq!(status, 200, "timeout is a business error");
    assert_eq!(envelope.code, 1002);
    assert_eq!(envelope.data["error_type"], "CMD_TIMEOUT");
    assert_eq!(envelope.data["timeout"], 1);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(1),
        "the deadline must actually elapse before 1002 is produced"
    );
    assert!(
        elapsed < Duration::from_secs(6),
        "SIGTERM must end the child well before the SIGKILL escalation"
    );

    h.server.stop();
    let _ = h.task.await;
}

/// A handler that overruns its deadline, then unwinds cooperatively (the
/// way the shell handler reaps its child) and marks that it got to finish.
struct SlowUnwindHandler {
    completed: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for SlowUnwindHandler {
    async fn handle(&self, ctx: &RequestContext) -> virtrpc::Result<Value> {
        tokio::time::sleep(ctx.deadline + Duration::from_secs(2)).await;
        self.completed.store(true, Ordering::SeqCst);
        Err(Error::CmdTimeout {
            timeout_secs: ctx.deadline.as_secs(),
        })
    }
}

#[tokio::test]
async fn dispatch_waits_for_handler_to_unwind() {
    let completed = Arc::new(AtomicBool::new(false));
    let mut server = Server::new(test_config()).unwrap();
    server
        .register(
            Method::Post,
            "/api/v1/test/slow-unwind",
            Arc::new(SlowUnwindHandler {
                completed: Arc::clone(&completed),
            }),
            RouteOptions::default(),
        )
        .unwrap();
    let server = Arc::new(server);

    let (host_end, guest_end) = UnixStream::pair().unwrap();
    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.serve_stream(guest_end).await;
        })
    };
    let mut peer = Channel::new(host_end, 8192);

    let started = std::time::Instant::now();
    let req = HttpRequest::new(Method::Post, "/api/v1/test/slow-unwind")
        .with_json_body(br#"{"timeout":1}"#.to_vec());
    peer.write_all(&req.to_bytes(), Deadline::none())
        .await
        .unwrap();
    let response = read_response(
        &mut peer,
        usize::MAX,
        Deadline::after(Duration::from_secs(10)),
    )
    .await
    .unwrap();
    let envelope = ResponseEnvelope::from_http(&response).unwrap();

    assert_eq!(envelope.code, 1002);
    assert!(
        completed.load(Ordering::SeqCst),
        "dispatch must not drop the handler future before it unwinds"
    );
    assert!(
        started.elapsed() >= Duration::from_millis(2500),
        "the response must come from the handler's own unwind, not abandonment at the deadline"
    );

    server.stop();
    let _ = task.await;
}

#[tokio::test]
async fn back_to_back_requests_answered_in_order() {
    let mut h = start(test_config()).await;

    // Both requests hit the stream before either response is read.
    h.send_raw(
        b"GET /api/v1/ping HTTP/1.1\r\nContent-Length: 0\r\nX-Request-ID: first\r\n\r\n\
          GET /api/v1/ping HTTP/1.1\r\nContent-Length: 0\r\nX-Request-ID: second\r\n\r\n",
    )
    .await;

    let (_, first_id, first) = h.recv().await;
    let (_, second_id, second) = h.recv().await;
    assert_eq!(first_id.as_deref(), Some("first"));
    assert_eq!(second_id.as_deref(), Some("second"));
    assert_eq!(first.code, 0);
    assert_eq!(second.code, 0);

    h.server.stop();
    let _ = h.task.await;
}

#[tokio::test]
async fn malformed_request_answers_then_drops_channel() {
    let mut h = start(test_config()).await;

    h.send_raw(b"GET /x HTTP/1.0\r\nContent-Length: 0\r\n\r\n")
        .await;
    let (status, _, envelope) = h.recv().await;
    assert_eq!(status, 400);
    assert_eq!(envelope.code, 2002);

    // The server abandoned this channel; its serve task finishes.
    let _ = tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("serve task should exit after framing fault");

    h.server.stop();
}

#[tokio::test]
async fn missing_request_id_gets_generated_one() {
    let mut h = start(test_config()).await;

    h.send(&HttpRequest::new(Method::Get, "/api/v1/ping")).await;
    let (_, request_id, envelope) = h.recv().await;

    assert_eq!(envelope.code, 0);
    let id = request_id.expect("server must stamp a request id");
    assert!(!id.is_empty());

    h.server.stop();
    let _ = h.task.await;
}

#[tokio::test]
async fn stop_finishes_loop() {
    let h = start(test_config()).await;
    h.server.stop();
    tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("serve task should stop")
        .unwrap();
}

#[tokio::test]
async fn json_body_fault_is_2002() {
    let mut h = start(test_config()).await;

    let req = HttpRequest::new(Method::Post, "/api/v1/shell/exec")
        .with_json_body(b"{not valid json".to_vec());
    h.send(&req).await;
    let (status, _, envelope) = h.recv().await;

    assert_eq!(status, 400);
    assert_eq!(envelope.code, 2002);

    h.server.stop();
    let _ = h.task.await;
}

#[tokio::test]
async fn response_time_header_present() {
    let mut h = start(test_config()).await;

    h.send(&HttpRequest::new(Method::Get, "/api/v1/ping")).await;
    let response = read_response(
        &mut h.peer,
        usize::MAX,
        Deadline::after(Duration::from_secs(10)),
    )
    .await
    .unwrap();

    let ms: u64 = response
        .headers
        .get("X-Response-Time")
        .expect("response time header")
        .parse()
        .unwrap();
    assert!(ms < 10_000);

    h.server.stop();
    let _ = h.task.await;
}
