use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use assert_matches::assert_matches;
use reqwest::StatusCode;
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use fwlib::{
    download::{DownloadError, Downloader},
    firmware::{CatalogError, FirmwareClient, LISTING_PATH},
    transport::{HttpTransport, RetryPolicy, TransportError},
};

fn transport(max_retries: u32) -> HttpTransport {
    HttpTransport::new(RetryPolicy::new(max_retries, Duration::from_millis(1)))
        .expect("failed to build transport")
}

/// Read until the end of the request headers. Listing requests have no body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = vec![];
    let mut chunk = [0u8; 1024];

    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Accept connections forever, passing each one to `handler` along with its
/// 0-based index. Returns the base URL and the number of accepted connections.
async fn raw_server<F>(mut handler: F) -> (String, Arc<AtomicU32>)
where
    F: FnMut(u32, TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            handler(counter.fetch_add(1, Ordering::SeqCst), socket);
        }
    });

    (url, accepted)
}

#[tokio::test]
async fn test_list_firmware() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(LISTING_PATH))
        .and(header("type", "42"))
        .and(header("beta", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "list": [
                {"fileName": "Ultimate_V1.0", "filePathName": "/fw/a.dat", "date": 20230101},
                "{\"fileName\":\"Ultimate_V1.1\",\"filePathName\":\"/fw/b.dat\",\"date\":20240101}",
                "garbage",
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = FirmwareClient::new(transport(5), server.uri());
    let records = client.list_firmware(42).await.unwrap();

    let names: Vec<_> = records.iter().map(|r| r.file_name.as_str()).collect();
    assert_eq!(names, ["Ultimate_V1.1", "Ultimate_V1.0"]);
    assert_eq!(client.download_url(&records[0]), Some(format!("{}/fw/b.dat", server.uri())));
}

#[tokio::test]
async fn test_list_firmware_retries_server_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(LISTING_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(LISTING_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "list": [{"fileName": "fw", "date": 1}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let notices = Arc::new(Mutex::new(vec![]));
    let notices_hook = notices.clone();

    let client = FirmwareClient::new(
        transport(5).on_retry(move |n| notices_hook.lock().unwrap().push(n.attempt)),
        server.uri(),
    );
    let records = client.list_firmware(1).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(*notices.lock().unwrap(), [1, 2]);
}

#[tokio::test]
async fn test_list_firmware_client_error_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = FirmwareClient::new(transport(5), server.uri());

    assert_matches!(
        client.list_firmware(1).await,
        Err(CatalogError::RequestFailed(TransportError::ClientError(s)))
            if s == StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_list_firmware_exhausted() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = FirmwareClient::new(transport(3), server.uri());
    let err = client.list_firmware(1).await.unwrap_err();

    assert_matches!(
        &err,
        CatalogError::RequestFailed(TransportError::ExhaustedRetries { attempts: 3, source })
            if matches!(**source, TransportError::ServerError(s) if s == StatusCode::INTERNAL_SERVER_ERROR)
    );
}

#[tokio::test]
async fn test_list_firmware_invalid_payload() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = FirmwareClient::new(transport(1), server.uri());
    assert_matches!(client.list_firmware(1).await, Err(CatalogError::InvalidPayload(_)));
}

#[tokio::test]
async fn test_list_firmware_empty() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"list": ["x", 1]})))
        .mount(&server)
        .await;

    let client = FirmwareClient::new(transport(1), server.uri());
    assert_matches!(client.list_firmware(1).await, Err(CatalogError::EmptyCatalog));
}

#[tokio::test]
async fn test_download() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    Mock::given(method("GET"))
        .and(path("/fw/ultimate.dat"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("Ultimate").join("fw.dat");
    let url = format!("{}/fw/ultimate.dat", server.uri());

    let mut percents = vec![];
    let written = Downloader::new(transport(1))
        .download(&url, &dest, |p| percents.push(p.percent()))
        .await
        .unwrap();

    assert_eq!(written, 10_000);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(percents, [Some(40), Some(81), Some(100)]);
}

#[tokio::test]
async fn test_download_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("fw.dat");
    let url = format!("{}/missing.dat", server.uri());

    assert_matches!(
        Downloader::new(transport(5)).download(&url, &dest, |_| {}).await,
        Err(DownloadError::RequestFailed(TransportError::ClientError(s)))
            if s == StatusCode::NOT_FOUND
    );
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_download_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200)
            .set_body_bytes(b"late".to_vec())
            .set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("fw.dat");
    let url = format!("{}/slow.dat", server.uri());

    let result = Downloader::new(transport(2))
        .timeout(Duration::from_millis(100))
        .download(&url, &dest, |_| {})
        .await;

    assert_matches!(
        result,
        Err(DownloadError::RequestFailed(TransportError::ExhaustedRetries { attempts: 2, source }))
            if matches!(*source, TransportError::Timeout)
    );
}

#[tokio::test]
async fn test_list_firmware_retries_dropped_connections() {
    let (url, accepted) = raw_server(|_, mut socket| {
        tokio::spawn(async move {
            read_request(&mut socket).await;
            drop(socket);
        });
    }).await;

    let client = FirmwareClient::new(transport(3), url);

    assert_matches!(
        client.list_firmware(1).await,
        Err(CatalogError::RequestFailed(TransportError::ExhaustedRetries { attempts: 3, source }))
            if matches!(*source, TransportError::ConnectionFailed(_))
    );
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_list_firmware_retries_stalled_body() {
    let (url, accepted) = raw_server(|n, mut socket| {
        tokio::spawn(async move {
            read_request(&mut socket).await;

            if n == 0 {
                // Promise 100 bytes, send 4, then hang
                socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n{\"li").await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
            } else {
                let body = r#"{"list": [{"fileName": "fw", "date": 1}]}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });
    }).await;

    let client = FirmwareClient::new(transport(3), url)
        .timeout(Duration::from_millis(200));
    let records = client.list_firmware(1).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_name, "fw");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
