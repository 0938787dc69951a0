use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::put;
use axum::Router;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;

use map_relay::errors::AppError;
use map_relay::history::{JsonFileStore, UploadHistory};
use map_relay::relay::{router, AppState, ChunkAssembler, ChunkOutcome, MapApiClient, RetryPolicy};
use map_relay::uploader::{self, progress, RelayClient, UploadStrategy};

/// Integration tests for the map relay backend
/// External endpoints are stubbed with in-process axum servers

#[derive(Clone)]
struct StubBehavior {
    counter: Arc<AtomicUsize>,
    kind: StubKind,
}

#[derive(Clone)]
enum StubKind {
    /// Fail with 503 this many times, then answer 200 with the given body.
    FailThenSucceed { failures: usize, url: String },
    /// Always answer with the given status and an empty body.
    AlwaysStatus(u16),
    /// Answer 200 with an empty body.
    EmptySuccess,
}

async fn stub_handler(State(stub): State<StubBehavior>, _body: Bytes) -> (StatusCode, String) {
    let calls_so_far = stub.counter.fetch_add(1, Ordering::SeqCst);

    match &stub.kind {
        StubKind::FailThenSucceed { failures, url } => {
            if calls_so_far < *failures {
                (StatusCode::SERVICE_UNAVAILABLE, String::new())
            } else {
                (StatusCode::OK, url.clone())
            }
        }
        StubKind::AlwaysStatus(code) => (StatusCode::from_u16(*code).unwrap(), String::new()),
        StubKind::EmptySuccess => (StatusCode::OK, String::new()),
    }
}

/// Spawn a stub external upload API on an ephemeral port. Returns the base
/// URL (trailing slash included) and the PUT attempt counter.
async fn spawn_stub_external(kind: StubKind) -> (String, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let state = StubBehavior {
        counter: counter.clone(),
        kind,
    };

    let app = Router::new()
        .route("/maps/:name", put(stub_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/maps/", addr), counter)
}

fn no_delay_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::ZERO,
        step: Duration::ZERO,
    }
}

/// Spawn a relay endpoint wired to the given stub external API, with its
/// temp artifacts rooted in `upload_dir`. Returns the endpoint URL.
async fn spawn_relay(external_base: &str, upload_dir: &Path) -> String {
    let client = MapApiClient::with_policy(external_base, no_delay_policy());
    let assembler = ChunkAssembler::new(upload_dir.to_path_buf()).unwrap();
    let app = router(AppState::new(client, assembler));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}/api/upload", addr)
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("map-relay-test-{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_scratch_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn assert_dir_empty(dir: &Path) {
    let leftover: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(
        leftover.is_empty(),
        "Expected no upload artifacts, found {:?}",
        leftover
    );
}

#[tokio::test]
async fn retry_recovers_after_transient_failures() {
    let url = "http://files.facepunch.com/maps/retry.map".to_string();
    let (base, counter) = spawn_stub_external(StubKind::FailThenSucceed {
        failures: 2,
        url: url.clone(),
    })
    .await;

    let dir = scratch_dir("retry");
    let path = write_scratch_file(&dir, "retry.map", b"map bytes");

    let client = MapApiClient::with_policy(&base, no_delay_policy());
    let result = client.upload_map(&path, "retry.map").await.unwrap();

    assert_eq!(result, Some(url));
    assert_eq!(counter.load(Ordering::SeqCst), 3, "expected exactly 3 attempts");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn reserved_characters_in_file_names_do_not_burn_retries() {
    let url = "http://files.facepunch.com/maps/reserved.map".to_string();
    let (base, counter) = spawn_stub_external(StubKind::FailThenSucceed {
        failures: 0,
        url: url.clone(),
    })
    .await;

    let dir = scratch_dir("reserved");
    let path = write_scratch_file(&dir, "reserved.map", b"map bytes");

    // Spaces and `#` survive sanitization; the PUT URL must encode them.
    let client = MapApiClient::with_policy(&base, no_delay_policy());
    let result = client.upload_map(&path, "my map#1.map").await.unwrap();

    assert_eq!(result, Some(url));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let (base, counter) = spawn_stub_external(StubKind::AlwaysStatus(404)).await;

    let dir = scratch_dir("rejected");
    let path = write_scratch_file(&dir, "rejected.map", b"map bytes");

    let client = MapApiClient::with_policy(&base, no_delay_policy());
    let result = client.upload_map(&path, "rejected.map").await.unwrap();

    assert_eq!(result, None);
    assert_eq!(counter.load(Ordering::SeqCst), 1, "a 4xx must short-circuit");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn transient_failures_exhaust_the_attempt_cap() {
    let (base, counter) = spawn_stub_external(StubKind::AlwaysStatus(503)).await;

    let dir = scratch_dir("exhausted");
    let path = write_scratch_file(&dir, "exhausted.map", b"map bytes");

    let client = MapApiClient::with_policy(&base, no_delay_policy());
    let result = client.upload_map(&path, "exhausted.map").await.unwrap();

    assert_eq!(result, None);
    assert_eq!(counter.load(Ordering::SeqCst), 10);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn empty_success_body_is_a_protocol_violation() {
    let (base, counter) = spawn_stub_external(StubKind::EmptySuccess).await;

    let dir = scratch_dir("violation");
    let path = write_scratch_file(&dir, "violation.map", b"map bytes");

    let client = MapApiClient::with_policy(&base, no_delay_policy());
    let result = client.upload_map(&path, "violation.map").await;

    match result {
        Err(e @ AppError::ProtocolViolation { .. }) => {
            assert!(e.is_permanent());
            assert!(!e.is_retryable());
        }
        other => panic!("Expected a protocol violation, got {:?}", other),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1, "a malformed 2xx must not be retried");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn sequential_chunks_rebuild_an_identical_file() {
    let dir = scratch_dir("assembly");
    let assembler = ChunkAssembler::new(dir.clone()).unwrap();

    let original: Vec<u8> = (0u8..=255).cycle().take(3000).collect();
    let chunks: Vec<&[u8]> = original.chunks(1024).collect();
    let total = chunks.len() as u32;

    let mut assembled_path = None;
    for (index, chunk) in chunks.iter().enumerate() {
        match assembler
            .append_chunk("rebuild.map", index as u32, total, chunk)
            .await
            .unwrap()
        {
            ChunkOutcome::Appended { received, total } => {
                assert_eq!(received, index as u32 + 1);
                assert_eq!(total, 3);
            }
            ChunkOutcome::Completed(path) => assembled_path = Some(path),
        }
    }

    let assembled_path = assembled_path.expect("final chunk must complete the file");
    assert_eq!(assembled_path, dir.join("rebuild.map"));

    let rebuilt = std::fs::read(&assembled_path).unwrap();
    assert_eq!(rebuilt, original);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn out_of_order_chunks_corrupt_the_result() {
    let dir = scratch_dir("disorder");
    let assembler = ChunkAssembler::new(dir.clone()).unwrap();

    let original = b"AAAABBBBCC".to_vec();
    let chunks: [&[u8]; 3] = [b"AAAA", b"BBBB", b"CC"];

    // Arrival order 1, 0, 2: the assembler appends blindly, so this must
    // not reconstruct the original bytes.
    assembler
        .append_chunk("disorder.map", 1, 3, chunks[1])
        .await
        .unwrap();
    assembler
        .append_chunk("disorder.map", 0, 3, chunks[0])
        .await
        .unwrap();
    let outcome = assembler
        .append_chunk("disorder.map", 2, 3, chunks[2])
        .await
        .unwrap();

    let assembled_path = match outcome {
        ChunkOutcome::Completed(path) => path,
        ChunkOutcome::Appended { .. } => panic!("final chunk must complete the file"),
    };

    let rebuilt = std::fs::read(&assembled_path).unwrap();
    assert_ne!(rebuilt, original, "out-of-order appends must not silently succeed");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn history_keeps_entries_in_insertion_order() {
    let dir = scratch_dir("history");
    let history = UploadHistory::new(JsonFileStore::new(dir.clone()).unwrap());

    history.record("a.map", "http://files.facepunch.com/maps/a.map").unwrap();
    history.record("b.map", "http://files.facepunch.com/maps/b.map").unwrap();

    let entries = history.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "a.map");
    assert_eq!(entries[1].name, "b.map");
    assert!(entries[0].timestamp <= entries[1].timestamp);

    history.clear().unwrap();
    assert!(history.entries().unwrap().is_empty());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn corrupt_history_is_replaced_not_fatal() {
    let dir = scratch_dir("corrupt-history");
    let store = JsonFileStore::new(dir.clone()).unwrap();
    std::fs::write(dir.join("uploadedMaps.json"), b"not json at all").unwrap();

    let history = UploadHistory::new(store);
    assert!(history.entries().unwrap().is_empty());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn whole_file_upload_end_to_end() {
    let url = "http://files.facepunch.com/maps/whole.map".to_string();
    let (base, counter) = spawn_stub_external(StubKind::FailThenSucceed {
        failures: 0,
        url: url.clone(),
    })
    .await;

    let upload_dir = scratch_dir("whole-relay");
    let relay_url = spawn_relay(&base, &upload_dir).await;

    let source_dir = scratch_dir("whole-source");
    let path = write_scratch_file(&source_dir, "whole.map", b"whole map bytes");

    let history_dir = scratch_dir("whole-history");
    let history = UploadHistory::new(JsonFileStore::new(history_dir.clone()).unwrap());

    let client = RelayClient::new(relay_url);
    let progress_state = uploader::new_progress();
    let returned = uploader::upload_file(
        &client,
        &history,
        &path,
        UploadStrategy::Whole,
        &progress_state,
    )
    .await
    .unwrap();

    assert_eq!(returned, url);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Success is recorded, and the relay leaves nothing behind.
    let entries = history.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "whole.map");
    assert_eq!(entries[0].url, url);
    assert_dir_empty(&upload_dir);

    for dir in [upload_dir, source_dir, history_dir] {
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

#[tokio::test]
async fn chunked_upload_end_to_end() {
    let url = "http://files.facepunch.com/maps/chunked.map".to_string();
    let (base, counter) = spawn_stub_external(StubKind::FailThenSucceed {
        failures: 0,
        url: url.clone(),
    })
    .await;

    let upload_dir = scratch_dir("chunked-relay");
    let relay_url = spawn_relay(&base, &upload_dir).await;

    let source_dir = scratch_dir("chunked-source");
    let path = write_scratch_file(&source_dir, "chunked.map", b"0123456789");

    // 10 bytes in 4-byte chunks: three sequential requests.
    let client = RelayClient::with_chunk_size(relay_url, 4);
    let progress_state = uploader::new_progress();
    let returned = client
        .upload(&path, UploadStrategy::Chunked, &progress_state)
        .await
        .unwrap();

    assert_eq!(returned, url);
    // The relay reassembles before relaying: one PUT for three chunks.
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let snapshot = progress::snapshot(&progress_state).unwrap();
    assert_eq!(snapshot.total_chunks, 3);
    assert_eq!(snapshot.sent_chunks, 3);
    assert_eq!(snapshot.status, uploader::UploadStatus::Completed);

    assert_dir_empty(&upload_dir);

    for dir in [upload_dir, source_dir] {
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

#[tokio::test]
async fn rejected_upload_leaves_no_artifacts() {
    let (base, _counter) = spawn_stub_external(StubKind::AlwaysStatus(404)).await;

    let upload_dir = scratch_dir("cleanup-relay");
    let relay_url = spawn_relay(&base, &upload_dir).await;

    let source_dir = scratch_dir("cleanup-source");
    let path = write_scratch_file(&source_dir, "cleanup.map", b"0123456789");

    let progress_whole = uploader::new_progress();
    let client = RelayClient::with_chunk_size(relay_url, 4);
    let whole = client
        .upload(&path, UploadStrategy::Whole, &progress_whole)
        .await;
    assert!(whole.is_err());
    assert_dir_empty(&upload_dir);

    let progress_chunked = uploader::new_progress();
    let chunked = client
        .upload(&path, UploadStrategy::Chunked, &progress_chunked)
        .await;
    assert!(chunked.is_err());
    assert_dir_empty(&upload_dir);

    let snapshot = progress::snapshot(&progress_chunked).unwrap();
    assert_eq!(snapshot.status, uploader::UploadStatus::Failed);

    for dir in [upload_dir, source_dir] {
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

#[tokio::test]
async fn requests_missing_fields_are_rejected() {
    let (base, counter) = spawn_stub_external(StubKind::EmptySuccess).await;

    let upload_dir = scratch_dir("missing-fields");
    let relay_url = spawn_relay(&base, &upload_dir).await;
    let http = reqwest::Client::new();

    // No file and no chunk.
    let form = reqwest::multipart::Form::new().text("fileName", "a.map");
    let response = http.post(&relay_url).multipart(form).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Chunk without its metadata fields.
    let form = reqwest::multipart::Form::new()
        .part("chunk", reqwest::multipart::Part::bytes(b"data".to_vec()));
    let response = http.post(&relay_url).multipart(form).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Unparseable chunk metadata.
    let form = reqwest::multipart::Form::new()
        .text("fileName", "a.map")
        .text("chunkIndex", "zero")
        .text("totalChunks", "2")
        .part("chunk", reqwest::multipart::Part::bytes(b"data".to_vec()));
    let response = http.post(&relay_url).multipart(form).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Nothing ever reached the external API.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_dir_empty(&upload_dir);

    std::fs::remove_dir_all(&upload_dir).unwrap();
}

#[tokio::test]
async fn intermediate_chunks_are_acknowledged_without_a_url() {
    let (base, counter) = spawn_stub_external(StubKind::EmptySuccess).await;

    let upload_dir = scratch_dir("chunk-ack");
    let relay_url = spawn_relay(&base, &upload_dir).await;
    let http = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .text("fileName", "ack.map")
        .text("chunkIndex", "0")
        .text("totalChunks", "3")
        .part("chunk", reqwest::multipart::Part::bytes(b"data".to_vec()));
    let response = http.post(&relay_url).multipart(form).send().await.unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Chunk 1 of 3 uploaded successfully");
    assert!(body.get("url").is_none());

    // Not the final chunk, so no PUT yet and the partial file remains.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(upload_dir.join("ack.map.part").exists());

    std::fs::remove_dir_all(&upload_dir).unwrap();
}
