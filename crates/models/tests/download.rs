//! HTTP fetcher tests against a locally scripted server.
//!
//! Each test binds a real TCP listener, seeds it with canned responses per
//! path, and points the fetcher at it. Hit counters make retries observable.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use banter_models::{
    AssetFetcher, DownloadPlan, FetchEvent, HttpAssetFetcher, ModelError, PlannedFile, RetryPolicy,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted server
// =============================================================================

/// One canned response.
enum Canned {
    /// 200 with the body in a single write.
    Ok(Vec<u8>),
    /// Error status with an empty body.
    Status(u16),
    /// 200 that claims `claim` bytes but sends only `body` and closes.
    Truncated { body: Vec<u8>, claim: usize },
    /// 200 that sends `first`, pauses, then sends `rest`.
    Paced {
        first: Vec<u8>,
        rest: Vec<u8>,
        pause: Duration,
    },
}

/// Minimal HTTP/1.1 server that replays scripted responses per path and
/// counts requests. Paths with an exhausted (or absent) script answer 404.
struct TestServer {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl TestServer {
    async fn start(routes: Vec<(&str, Vec<Canned>)>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let task_hits = Arc::clone(&hits);
        let mut scripts: HashMap<String, VecDeque<Canned>> = routes
            .into_iter()
            .map(|(path, canned)| (path.to_string(), VecDeque::from(canned)))
            .collect();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let Some(path) = read_request_path(&mut socket).await else {
                    continue;
                };
                *task_hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

                let canned = scripts
                    .get_mut(&path)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Canned::Status(404));
                respond(&mut socket, canned).await;
            }
        });

        TestServer { addr, hits }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn read_request_path(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.split_whitespace();
    let _method = parts.next()?;
    parts.next().map(str::to_string)
}

async fn respond(socket: &mut TcpStream, canned: Canned) {
    match canned {
        Canned::Ok(body) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
        }
        Canned::Status(code) => {
            let head =
                format!("HTTP/1.1 {code} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
        }
        Canned::Truncated { body, claim } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {claim}\r\nConnection: close\r\n\r\n"
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
        }
        Canned::Paced { first, rest, pause } => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                first.len() + rest.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&first).await;
            let _ = socket.flush().await;
            tokio::time::sleep(pause).await;
            let _ = socket.write_all(&rest).await;
        }
    }
    let _ = socket.shutdown().await;
}

// =============================================================================
// Helpers
// =============================================================================

type EventLog = Arc<Mutex<Vec<FetchEvent>>>;

fn recorder() -> (EventLog, impl Fn(FetchEvent) + Send + Sync) {
    let events: EventLog = Arc::default();
    let sink = Arc::clone(&events);
    (events, move |event| sink.lock().unwrap().push(event))
}

fn planned(server: &TestServer, dir: &Path, name: &str) -> PlannedFile {
    PlannedFile {
        url: server.url(&format!("/{name}")),
        dest: dir.join(name),
        file: name.to_string(),
        sha256: None,
    }
}

/// Retry quickly so failure tests stay fast.
fn quick_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
    }
}

// =============================================================================
// Success path
// =============================================================================

#[tokio::test]
async fn test_fetch_transfers_files_sequentially() {
    let server = TestServer::start(vec![
        ("/a.json", vec![Canned::Ok(b"aaaa".to_vec())]),
        ("/b.bin", vec![Canned::Ok(b"bbbbbbbb".to_vec())]),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![
            planned(&server, dir.path(), "a.json"),
            planned(&server, dir.path(), "b.bin"),
        ],
    };
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let summary = HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(summary.files_fetched, 2);
    assert_eq!(summary.bytes_fetched, 12);
    assert_eq!(std::fs::read(dir.path().join("a.json")).unwrap(), b"aaaa");
    assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), b"bbbbbbbb");
    assert_eq!(server.hits("/a.json"), 1);
    assert_eq!(server.hits("/b.bin"), 1);

    let events = events.lock().unwrap();
    let started: Vec<(String, usize, usize, u64)> = events
        .iter()
        .filter_map(|e| match e {
            FetchEvent::Started {
                file,
                index,
                count,
                total_bytes,
            } => Some((file.clone(), *index, *count, *total_bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            ("a.json".to_string(), 1, 2, 4),
            ("b.bin".to_string(), 2, 2, 8),
        ]
    );

    // One file finishes before the next begins.
    let first_completed = events
        .iter()
        .position(|e| matches!(e, FetchEvent::Completed { file, .. } if file == "a.json"))
        .unwrap();
    let second_started = events
        .iter()
        .position(|e| matches!(e, FetchEvent::Started { file, .. } if file == "b.bin"))
        .unwrap();
    assert!(first_completed < second_started);
}

#[tokio::test]
async fn test_fetch_progress_runs_zero_to_hundred() {
    let server = TestServer::start(vec![(
        "/file.bin",
        vec![Canned::Ok(vec![7u8; 10_000])],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "file.bin")],
    };
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();

    HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await
        .unwrap();

    let percents: Vec<u8> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            FetchEvent::Progress { progress, .. } => Some(progress.file_percent()),
            _ => None,
        })
        .collect();
    assert_eq!(percents.first(), Some(&0), "headers prime a 0% report");
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] < w[1]), "strictly rising: {percents:?}");
}

#[tokio::test]
async fn test_fetch_empty_plan_is_a_no_op() {
    let plan = DownloadPlan::default();
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let summary = HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(summary.files_fetched, 0);
    assert_eq!(summary.bytes_fetched, 0);
    assert!(events.lock().unwrap().is_empty());
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_fetch_retries_after_server_error() {
    let server = TestServer::start(vec![(
        "/flaky.json",
        vec![Canned::Status(500), Canned::Ok(b"payload".to_vec())],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "flaky.json")],
    };
    let (_events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let summary = HttpAssetFetcher::new()
        .fetch(&plan, quick_retries(3), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(server.hits("/flaky.json"), 2, "second attempt succeeded");
    assert_eq!(summary.files_fetched, 1);
    assert_eq!(
        std::fs::read(dir.path().join("flaky.json")).unwrap(),
        b"payload"
    );
}

#[tokio::test]
async fn test_fetch_retries_truncated_transfer() {
    let server = TestServer::start(vec![(
        "/cut.bin",
        vec![
            Canned::Truncated {
                body: b"half".to_vec(),
                claim: 8,
            },
            Canned::Ok(b"complete".to_vec()),
        ],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "cut.bin")],
    };
    let (_events, on_event) = recorder();
    let cancel = CancellationToken::new();

    HttpAssetFetcher::new()
        .fetch(&plan, quick_retries(3), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(server.hits("/cut.bin"), 2);
    assert_eq!(std::fs::read(dir.path().join("cut.bin")).unwrap(), b"complete");
    assert!(!dir.path().join("cut.bin.part").exists());
}

#[tokio::test]
async fn test_fetch_gives_up_after_max_attempts() {
    let server = TestServer::start(vec![(
        "/bad.json",
        vec![Canned::Status(500), Canned::Status(500), Canned::Status(500)],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "bad.json")],
    };
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let result = HttpAssetFetcher::new()
        .fetch(&plan, quick_retries(3), &cancel, &on_event)
        .await;

    assert!(matches!(
        result,
        Err(ModelError::Http { ref file, .. }) if file == "bad.json"
    ));
    assert_eq!(server.hits("/bad.json"), 3, "one request per attempt");
    assert!(!dir.path().join("bad.json").exists());
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .all(|e| !matches!(e, FetchEvent::Completed { .. })));
}

// =============================================================================
// Skips
// =============================================================================

#[tokio::test]
async fn test_fetch_skips_files_already_present() {
    let server = TestServer::start(vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let existing = vec![b'x'; 2000];
    std::fs::write(dir.path().join("big.bin"), &existing).unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "big.bin")],
    };
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let summary = HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(summary.files_fetched, 0);
    assert_eq!(summary.bytes_fetched, 0);
    assert_eq!(server.hits("/big.bin"), 0, "no request for a present file");
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(std::fs::read(dir.path().join("big.bin")).unwrap(), existing);
}

#[tokio::test]
async fn test_fetch_replaces_stub_sized_files() {
    let server = TestServer::start(vec![(
        "/small.json",
        vec![Canned::Ok(b"refreshed contents".to_vec())],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    // Under the skip threshold, so it counts as an aborted earlier attempt.
    std::fs::write(dir.path().join("small.json"), b"old").unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "small.json")],
    };
    let (_events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let summary = HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(summary.files_fetched, 1);
    assert_eq!(server.hits("/small.json"), 1);
    assert_eq!(
        std::fs::read(dir.path().join("small.json")).unwrap(),
        b"refreshed contents"
    );
}

// =============================================================================
// Checksums
// =============================================================================

#[tokio::test]
async fn test_fetch_accepts_matching_checksum() {
    let server = TestServer::start(vec![(
        "/sum.txt",
        vec![Canned::Ok(b"hello world".to_vec())],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let mut file = planned(&server, dir.path(), "sum.txt");
    file.sha256 =
        Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".to_string());
    let plan = DownloadPlan { files: vec![file] };
    let (_events, on_event) = recorder();
    let cancel = CancellationToken::new();

    HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("sum.txt")).unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn test_fetch_rejects_checksum_mismatch() {
    let server = TestServer::start(vec![(
        "/sum.txt",
        vec![Canned::Ok(b"hello world".to_vec())],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let mut file = planned(&server, dir.path(), "sum.txt");
    file.sha256 = Some("0".repeat(64));
    let plan = DownloadPlan { files: vec![file] };
    let (_events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let result = HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await;

    match result {
        Err(ModelError::ChecksumMismatch { file, actual, .. }) => {
            assert_eq!(file, "sum.txt");
            assert_eq!(
                actual,
                "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
            );
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert!(!dir.path().join("sum.txt").exists());
    assert!(!dir.path().join("sum.txt.part").exists(), "partial removed");
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_fetch_cancelled_before_start_makes_no_requests() {
    let server = TestServer::start(vec![(
        "/a.json",
        vec![Canned::Ok(b"aaaa".to_vec())],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "a.json")],
    };
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = HttpAssetFetcher::new()
        .fetch(&plan, RetryPolicy::none(), &cancel, &on_event)
        .await;

    assert!(matches!(result, Err(ModelError::Cancelled)));
    assert_eq!(server.hits("/a.json"), 0);
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_cancelled_between_chunks_removes_partial() {
    let server = TestServer::start(vec![(
        "/slow.bin",
        vec![Canned::Paced {
            first: vec![1u8; 4096],
            rest: vec![2u8; 4096],
            pause: Duration::from_secs(1),
        }],
    )])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let plan = DownloadPlan {
        files: vec![planned(&server, dir.path(), "slow.bin")],
    };
    let (events, on_event) = recorder();
    let cancel = CancellationToken::new();

    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        HttpAssetFetcher::new()
            .fetch(&plan, RetryPolicy::none(), &task_cancel, &on_event)
            .await
    });

    // Wait for the first half to land, then cancel during the pause.
    for _ in 0..400 {
        let seen = events.lock().unwrap().iter().any(|e| {
            matches!(e, FetchEvent::Progress { progress, .. } if progress.file_bytes_read > 0)
        });
        if seen {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(ModelError::Cancelled)));
    assert!(!dir.path().join("slow.bin").exists());
    assert!(!dir.path().join("slow.bin.part").exists(), "partial removed");
}
