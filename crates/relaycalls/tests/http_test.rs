use relaycalls::{CallerOptions, HttpCallerConstructor};
use relaycore::{pipe, BodyReader, CallError, Caller, ReferenceStore, Request, ServiceSpec};
use relayruntime::CallerConstructor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Accepts one connection, answers it and returns the raw request
async fn respond_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if request_complete(&received) {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;

        String::from_utf8_lossy(&received).to_string()
    });

    (format!("http://{}", addr), handle)
}

fn request_complete(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    let Some(end) = text.find("\r\n\r\n") else {
        return false;
    };

    let length = text[..end]
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    data.len() >= end + 4 + length
}

fn service(host: &str) -> ServiceSpec {
    let mut options = HashMap::new();
    options.insert("header.x-api-key".to_string(), "secret".to_string());

    ServiceSpec {
        name: "orders".to_string(),
        host: host.to_string(),
        caller: "http".to_string(),
        codec: "json".to_string(),
        options,
    }
}

fn request(method: &str, endpoint: &str, body: &str) -> Request {
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());

    Request {
        method: method.to_string(),
        endpoint: endpoint.to_string(),
        headers,
        body: BodyReader::from_bytes(body.to_string()),
        cancellation: CancellationToken::new(),
    }
}

#[tokio::test]
async fn test_http_caller_sends_request() {
    let (host, server) = respond_once("200 OK", r#"{"ok":true}"#).await;
    let caller = HttpCallerConstructor.dial(&service(&host)).unwrap();
    let (writer, reader) = pipe(4);

    let call = caller.call(
        request("post", "/orders", r#"{"id":7}"#),
        writer,
        Arc::new(ReferenceStore::new()),
    );
    let (result, body) = tokio::join!(call, reader.read_to_end());

    result.unwrap();
    assert_eq!(body.unwrap(), br#"{"ok":true}"#);

    let received = server.await.unwrap();
    let lowered = received.to_lowercase();
    assert!(received.starts_with("POST /orders HTTP/1.1"));
    assert!(lowered.contains("x-api-key: secret"));
    assert!(lowered.contains("content-type: application/json"));
    assert!(received.ends_with(r#"{"id":7}"#));
}

#[tokio::test]
async fn test_http_error_status_is_remote_error() {
    let (host, server) = respond_once("404 Not Found", r#"{"error":"no such order"}"#).await;
    let caller = HttpCallerConstructor.dial(&service(&host)).unwrap();
    let (writer, reader) = pipe(4);

    let call = caller.call(request("GET", "orders/9", ""), writer, Arc::new(ReferenceStore::new()));
    let (result, body) = tokio::join!(call, reader.read_to_end());

    assert_eq!(
        result.unwrap_err(),
        CallError::Remote {
            status: 404,
            message: r#"{"error":"no such order"}"#.to_string()
        }
    );
    assert!(body.is_err());
    assert!(server.await.unwrap().starts_with("GET /orders/9 HTTP/1.1"));
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let caller = HttpCallerConstructor.dial(&service(&host)).unwrap();
    let (writer, _reader) = pipe(4);

    let err = caller
        .call(request("GET", "/", ""), writer, Arc::new(ReferenceStore::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Transport(_)));
}

#[tokio::test]
async fn test_cancelled_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("http://{}", listener.local_addr().unwrap());

    let caller = HttpCallerConstructor.dial(&service(&host)).unwrap();
    let (writer, _reader) = pipe(4);
    let request = request("GET", "/", "");
    request.cancellation.cancel();

    let err = caller
        .call(request, writer, Arc::new(ReferenceStore::new()))
        .await
        .unwrap_err();

    assert_eq!(err, CallError::Cancelled);
    drop(listener);
}

#[test]
fn test_invalid_host_rejected() {
    assert!(HttpCallerConstructor.dial(&service("not a url")).is_err());

    let mut bad_header = service("http://localhost:1");
    bad_header.options.insert("header.bad header".to_string(), "x".to_string());
    assert!(HttpCallerConstructor.dial(&bad_header).is_err());
}

#[test]
fn test_caller_options() {
    let mut spec = service("http://localhost:1");
    assert_eq!(CallerOptions::parse(&spec.options).unwrap(), CallerOptions::default());

    spec.options.insert("flush_interval".to_string(), "100ms".to_string());
    spec.options.insert("timeout".to_string(), "2s".to_string());
    let options = CallerOptions::parse(&spec.options).unwrap();
    assert_eq!(options.flush_interval, Some(Duration::from_millis(100)));
    assert_eq!(options.timeout, Some(Duration::from_secs(2)));
    assert!(HttpCallerConstructor.dial(&spec).is_ok());

    spec.options.insert("timeout".to_string(), "later".to_string());
    assert!(CallerOptions::parse(&spec.options).is_err());
    assert!(HttpCallerConstructor.dial(&spec).is_err());
}

#[tokio::test]
async fn test_request_timeout_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(socket);
    });

    let mut spec = service(&host);
    spec.options.insert("timeout".to_string(), "100ms".to_string());
    let caller = HttpCallerConstructor.dial(&spec).unwrap();
    let (writer, _reader) = pipe(4);

    let err = caller
        .call(request("GET", "/", ""), writer, Arc::new(ReferenceStore::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Transport(_)));
    server.abort();
}

#[tokio::test]
async fn test_flush_interval_keeps_body_intact() {
    let (host, server) = respond_once("200 OK", r#"{"items":[1,2,3]}"#).await;
    let mut spec = service(&host);
    spec.options.insert("flush_interval".to_string(), "50ms".to_string());
    let caller = HttpCallerConstructor.dial(&spec).unwrap();
    let (writer, reader) = pipe(4);

    let call = caller.call(request("GET", "/items", ""), writer, Arc::new(ReferenceStore::new()));
    let (result, body) = tokio::join!(call, reader.read_to_end());

    result.unwrap();
    assert_eq!(body.unwrap(), br#"{"items":[1,2,3]}"#);
    server.await.unwrap();
}
