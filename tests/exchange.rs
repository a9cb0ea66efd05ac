use std::time::Duration;

use bytes::Bytes;
use fetchcore::Client;
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fetchcore=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn loopback() -> (TcpListener, http::Uri) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let uri = format!("http://{addr}/").parse().unwrap();
    (listener, uri)
}

/// S1 — a simple GET gets the full response body and the connection is
/// released back to the pool afterward.
#[tokio::test]
async fn get_with_content_length() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = sock.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET / HTTP/1.1"));
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\nhello")
            .await
            .unwrap();
    });

    let client = Client::new();
    let resp = client.get(uri).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"hello"));

    server.await.unwrap();
}

/// S2 — a GET retries after the connection closes before any response
/// byte arrives, up to `retry_limit`, and fails with a named error once
/// the budget runs out.
#[tokio::test]
async fn retries_idempotent_on_premature_close() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        for _ in 0..3 {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock); // close immediately, before writing anything
        }
    });

    let client = Client::builder()
        .retry_limit(2)
        .retry_delay(Duration::from_millis(5))
        .build()
        .unwrap();

    let err = client.get(uri).await.unwrap_err();
    match err {
        fetchcore::Error::Connect(msg) => assert!(msg.contains("tried to connect 3 times")),
        other => panic!("unexpected error: {other:?}"),
    }

    server.await.unwrap();
}

/// S3 — a non-idempotent POST does not retry after a premature close.
#[tokio::test]
async fn does_not_retry_non_idempotent() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
    });

    let client = Client::builder().retry_limit(2).build().unwrap();
    let err = client.post(uri, Bytes::new()).await.unwrap_err();
    match err {
        fetchcore::Error::Connect(msg) => assert!(msg.contains("can't retry POST method")),
        other => panic!("unexpected error: {other:?}"),
    }

    server.await.unwrap();
}

/// S4 — a HEAD response carries no body even when Content-Length says
/// otherwise.
#[tokio::test]
async fn head_has_no_body() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = sock.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HEAD / HTTP/1.1"));
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n")
            .await
            .unwrap();
    });

    let client = Client::new();
    let resp = client.head(uri).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());

    server.await.unwrap();
}

/// S5 — a read timeout during the body fires as a named error and the
/// connection is not reused afterward.
#[tokio::test]
async fn read_timeout_on_stalled_body() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let _ = sock.read(&mut buf).await.unwrap();
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = sock.write_all(b"hello").await;
    });

    let client = Client::builder()
        .read_timeout(Some(Duration::from_millis(200)))
        .build()
        .unwrap();

    let resp = client.get(uri).await.unwrap();
    let err = resp.into_body().collect().await.unwrap_err();
    assert!(matches!(
        err,
        fetchcore::Error::ReadTimeout(fetchcore::error::ReadTimeoutKind::Body)
    ));

    server.abort();
}

/// S6 — a second request to the same authority reuses the pooled
/// connection instead of opening a new one.
#[tokio::test]
async fn reuses_pooled_connection() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        for _ in 0..2 {
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok")
                .await
                .unwrap();
        }
    });

    let client = Client::new();
    let first = client.get(uri.clone()).await.unwrap();
    let _ = first.into_body().collect().await.unwrap();
    let second = client.get(uri).await.unwrap();
    let _ = second.into_body().collect().await.unwrap();

    server.await.unwrap();
}

/// S7 — a close that happens after some response bytes already arrived is
/// never retried, even for an idempotent GET, and surfaces as a distinct
/// named error from the "closed before any byte arrived" case in S2.
#[tokio::test]
async fn does_not_retry_after_partial_response() {
    init_tracing();
    let (listener, uri) = loopback().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let _ = sock.read(&mut buf).await.unwrap();
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Le").await.unwrap();
        // socket drops here, mid-headers
    });

    let client = Client::builder().retry_limit(2).build().unwrap();
    let err = client.get(uri).await.unwrap_err();
    match err {
        fetchcore::Error::Connect(msg) => {
            assert!(msg.contains("Server dropped connection before the response was complete"))
        }
        other => panic!("unexpected error: {other:?}"),
    }

    server.await.unwrap();
}
