//! Tests for the HTTP codec boundary behaviors.
//!
//! Validates the round-trip laws and the exact size limits: a header block
//! of exactly the cap parses, one byte more is rejected; declared bodies at
//! the route cap pass, one byte over is rejected before allocation.

use tokio::io::AsyncWriteExt;

use virtrpc::{
    read_body, read_request_head, read_response, Channel, Deadline, Error, HttpRequest,
    HttpResponse, Method, MAX_HEADER_BYTES,
};

// =============================================================================
// Helpers
// =============================================================================

/// Feeds raw bytes into a channel the way a peer would.
async fn channel_with(raw: Vec<u8>) -> Channel<tokio::io::DuplexStream> {
    let (mut tx, rx) = tokio::io::duplex(MAX_HEADER_BYTES * 4);
    tokio::spawn(async move {
        let _ = tx.write_all(&raw).await;
        // Keep the writer alive so EOF never races the reader.
        std::future::pending::<()>().await;
    });
    Channel::new(rx, 8192)
}

/// Builds a request whose serialized header block is exactly `target`
/// bytes, padding with an `X-Pad` header.
fn request_with_header_size(target: usize) -> Vec<u8> {
    let base = HttpRequest::new(Method::Get, "/api/v1/ping");
    let skeleton = {
        let mut r = base.clone();
        r.headers.set("X-Pad", "");
        r.to_bytes()
    };
    assert!(skeleton.len() < target, "padding target too small");
    let mut padded = base;
    padded
        .headers
        .set("X-Pad", "p".repeat(target - skeleton.len()));
    let bytes = padded.to_bytes();
    assert_eq!(bytes.len(), target);
    bytes
}

// =============================================================================
// Round-Trip Laws
// =============================================================================

#[tokio::test]
async fn request_parse_inverts_serialize() {
    let original = {
        let mut r = HttpRequest::new(Method::Post, "/api/v1/file/upload?overwrite=1")
            .with_json_body(br#"{"path":"/tmp/a","content":"aGk="}"#.to_vec());
        r.headers.set("X-Request-ID", "req-42");
        r
    };

    let mut ch = channel_with(original.to_bytes()).await;
    let head = read_request_head(&mut ch, Deadline::none()).await.unwrap();
    let body = read_body(&mut ch, head.content_length, usize::MAX, Deadline::none())
        .await
        .unwrap();

    assert_eq!(head.method, original.method);
    assert_eq!(head.path, original.path);
    assert_eq!(head.headers.get("X-Request-ID"), Some("req-42"));
    assert_eq!(body, original.body);
}

#[tokio::test]
async fn response_parse_inverts_serialize() {
    let original = {
        let mut r = HttpResponse::new(200)
            .with_json_body(br#"{"version":"1.0","code":0,"message":"success"}"#.to_vec());
        r.headers.set("X-Request-ID", "req-7");
        r.headers.set("X-Response-Time", "12");
        r
    };

    let mut ch = channel_with(original.to_bytes()).await;
    let parsed = read_response(&mut ch, usize::MAX, Deadline::none())
        .await
        .unwrap();

    assert_eq!(parsed.status, original.status);
    assert_eq!(parsed.reason, original.reason);
    assert_eq!(parsed.headers.get("X-Request-ID"), Some("req-7"));
    assert_eq!(parsed.headers.get("x-response-time"), Some("12"));
    assert_eq!(parsed.body, original.body);
}

// =============================================================================
// Header Boundaries
// =============================================================================

#[tokio::test]
async fn header_block_at_cap_is_accepted() {
    let raw = request_with_header_size(MAX_HEADER_BYTES);
    let mut ch = channel_with(raw).await;
    let head = read_request_head(&mut ch, Deadline::none()).await.unwrap();
    assert_eq!(head.path, "/api/v1/ping");
}

#[tokio::test]
async fn header_block_one_over_cap_is_oversize() {
    let raw = request_with_header_size(MAX_HEADER_BYTES + 1);
    let mut ch = channel_with(raw).await;
    let err = read_request_head(&mut ch, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Oversize { .. }), "got: {err}");
}

// =============================================================================
// Body Boundaries
// =============================================================================

#[tokio::test]
async fn body_at_cap_is_accepted_one_over_is_oversize() {
    let cap = 1024;

    let exact = HttpRequest::new(Method::Post, "/x").with_json_body(vec![b'a'; cap]);
    let mut ch = channel_with(exact.to_bytes()).await;
    let head = read_request_head(&mut ch, Deadline::none()).await.unwrap();
    let body = read_body(&mut ch, head.content_length, cap, Deadline::none())
        .await
        .unwrap();
    assert_eq!(body.len(), cap);

    let over = HttpRequest::new(Method::Post, "/x").with_json_body(vec![b'a'; cap + 1]);
    let mut ch = channel_with(over.to_bytes()).await;
    let head = read_request_head(&mut ch, Deadline::none()).await.unwrap();
    let err = read_body(&mut ch, head.content_length, cap, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Oversize { .. }));
}

// =============================================================================
// Framing Subset
// =============================================================================

#[tokio::test]
async fn duplicate_content_length_is_rejected() {
    let raw = b"POST /x HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let mut ch = channel_with(raw).await;
    let err = read_request_head(&mut ch, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[tokio::test]
async fn transfer_encoding_is_rejected() {
    let raw =
        b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 0\r\n\r\n".to_vec();
    let mut ch = channel_with(raw).await;
    let err = read_request_head(&mut ch, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[tokio::test]
async fn garbage_start_line_is_malformed() {
    let raw = b"NOT-HTTP nonsense here\r\n\r\n".to_vec();
    let mut ch = channel_with(raw).await;
    let err = read_request_head(&mut ch, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[tokio::test]
async fn missing_content_length_means_empty_body() {
    let raw = b"GET /api/v1/ping HTTP/1.1\r\nHost: virtio-rpc\r\n\r\n".to_vec();
    let mut ch = channel_with(raw).await;
    let head = read_request_head(&mut ch, Deadline::none()).await.unwrap();
    assert_eq!(head.content_length, 0);
    let body = read_body(&mut ch, 0, 10, Deadline::none()).await.unwrap();
    assert!(body.is_empty());
}
