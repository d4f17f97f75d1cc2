use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use speedgauge::speedtest::transport::{HttpTransport, Transport};
use speedgauge::speedtest::{cache_busted, UploadRate};
use speedgauge::{
    EndpointDescriptor, EngineConfig, MemoryStore, Orchestrator, ProgressReporter, ResultsStore,
    StaticCatalog, TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

const BLOB_BYTES: usize = 64 * 1024;

/// Request lines and headers seen by the test server, lowercased.
type Seen = Arc<Mutex<Vec<String>>>;

async fn spawn_server() -> (Url, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let _ = handle_client(stream, log).await;
            });
        }
    });

    (Url::parse(&format!("http://{}/", addr)).unwrap(), seen)
}

async fn handle_client(mut stream: TcpStream, seen: Seen) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let request_line = head.lines().next().unwrap_or_default().to_string();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    seen.lock().unwrap().push(head.clone());

    let mut body_read = buf.len() - header_end;
    while body_read < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body_read += n;
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let path = path.split('?').next().unwrap_or("/");
    let response: Vec<u8> = if request_line.starts_with("head ") {
        b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_vec()
    } else if path == "/blob" {
        let mut resp = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            BLOB_BYTES
        )
        .into_bytes();
        resp.extend(std::iter::repeat(b'x').take(BLOB_BYTES));
        resp
    } else if path == "/upload" {
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK".to_vec()
    } else {
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
    };

    stream.write_all(&response).await?;
    stream.flush().await?;
    stream.shutdown().await
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn probe_accepts_any_response_and_disables_caching() {
    let (base, seen) = spawn_server().await;
    transport().probe(&cache_busted(&base)).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("head /?t="));
    assert!(seen[0].contains("cache-control: no-cache"));
    assert!(seen[0].contains("pragma: no-cache"));
}

#[tokio::test]
async fn probe_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("http://{}/", addr)).unwrap();
    assert!(transport().probe(&url).await.is_err());
}

#[tokio::test]
async fn download_streams_the_whole_body() {
    let (base, _) = spawn_server().await;
    let mut stream = transport()
        .open_download(&base.join("blob").unwrap())
        .await
        .unwrap();

    let mut total = 0;
    while let Some(chunk) = stream.next().await {
        total += chunk.unwrap().len();
    }
    assert_eq!(total, BLOB_BYTES);
}

#[tokio::test]
async fn download_error_status_is_reported() {
    let (base, _) = spawn_server().await;
    let err = match transport()
        .open_download(&base.join("missing").unwrap())
        .await
    {
        Ok(_) => panic!("expected a status error"),
        Err(err) => err,
    };
    assert!(matches!(err, TransportError::Status { status: 404 }));
}

#[tokio::test]
async fn upload_posts_octet_stream() {
    let (base, seen) = spawn_server().await;
    let url = base.join("upload").unwrap();
    transport()
        .upload(&url, Bytes::from(vec![7u8; 10_000]))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen[0].starts_with("post /upload"));
    assert!(seen[0].contains("content-type: application/octet-stream"));
    assert!(seen[0].contains("content-length: 10000"));

    drop(seen);
    let err = transport()
        .upload(&base.join("nowhere").unwrap(), Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 404 }));
}

#[tokio::test]
async fn full_run_against_local_server() {
    let (base, seen) = spawn_server().await;
    let endpoint = EndpointDescriptor {
        id: "local".to_string(),
        display_name: "Local".to_string(),
        download_targets: vec![base.join("blob").unwrap()],
        upload_target: Some(base.join("upload").unwrap()),
        latency_target: base.clone(),
        is_default: true,
        is_active: true,
    };
    let config = EngineConfig {
        download_duration: Duration::from_secs(2),
        upload_duration: Duration::from_millis(500),
        probe_timeout: Duration::from_secs(1),
        upload_payload_bytes: 16 * 1024,
        partial_credit_bytes: 10_000,
        refresh: Duration::from_millis(50),
    };
    let store = Arc::new(MemoryStore::new(10));
    let engine = Orchestrator::new(
        Arc::new(transport()),
        Arc::new(StaticCatalog::new(vec![endpoint])),
        store.clone(),
        config,
        StdRng::seed_from_u64(1),
    );

    let record = engine
        .start(ProgressReporter::disabled())
        .await
        .unwrap()
        .expect("run should complete");

    assert_eq!(record.target_id, "local");
    assert_eq!(record.latency_samples, 5);
    assert!(record.download_bps > 0.0);
    assert!(matches!(record.upload, Some(UploadRate::Measured(bps)) if bps > 0.0));
    assert_eq!(store.recent(5).await.unwrap().len(), 1);

    let seen = seen.lock().unwrap();
    let blob_requests: Vec<&String> = seen.iter().filter(|h| h.starts_with("get /blob")).collect();
    assert_eq!(blob_requests.len(), 1);
    assert!(blob_requests[0].contains("?t="));
}
