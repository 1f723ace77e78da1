//! Integration tests for the generic download engine over a mock transport.

mod support;

use sion_dl::engine::CompletionState;
use sion_dl::integrity::{hash_file, HashAlgorithm};
use sion_dl::progress::{ProgressEvent, ProgressListener};
use sion_dl::session::{SessionStore, GENERIC_SIDECAR_EXT};
use sion_dl::{DownloadEngine, EngineConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{payload, MockTransport, Resource};

const MIB: usize = 1024 * 1024;
const URL: &str = "https://cdn.example.com/files/big.bin";

fn engine_with(
    transport: Arc<MockTransport>,
    config: EngineConfig,
) -> DownloadEngine {
    DownloadEngine::with_transport(config, transport).unwrap()
}

fn base_config(dir: &Path) -> EngineConfig {
    EngineConfig::new(URL, dir)
        .piece_size_kb(1024)
        .threads(4)
        .retries(0, Duration::from_millis(1))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_download_matches_source_and_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(10 * MIB, 1);
    let transport = Arc::new(MockTransport::new());
    transport.add_bytes(URL, data.clone());

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: ProgressListener = Arc::new(move |event| sink.lock().unwrap().push(event));

    let mut config = base_config(dir.path()).file_name("big.bin");
    config.report_interval = Duration::from_millis(20);
    let engine = engine_with(Arc::clone(&transport), config).listener(listener);

    let outcome = engine.execute().await.unwrap();
    assert_eq!(outcome.state, CompletionState::Done);
    assert_eq!(outcome.file_size, (10 * MIB) as u64);
    assert_eq!(outcome.file_name, "big.bin");

    let written = tokio::fs::read(&outcome.final_path).await.unwrap();
    assert_eq!(written, data);

    // Sidecar is gone after a verified completion.
    let sidecar = SessionStore::sidecar_path(&outcome.final_path, GENERIC_SIDECAR_EXT);
    assert!(!sidecar.exists());

    // The reporter's final sample saw the whole transfer.
    let events = events.lock().unwrap();
    let last = events.last().expect("at least the final sample");
    assert_eq!(last.bytes_transferred, (10 * MIB) as u64);
    assert_eq!(last.total_size, (10 * MIB) as u64);
    assert_eq!(last.units_done, 4);
    assert_eq!(last.units_total, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_rerequests_only_from_persisted_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(10 * MIB, 2);
    let transport = Arc::new(MockTransport::new());
    transport.add_bytes(URL, data.clone());

    // Every chunk dies after delivering 1 MiB; no retries in this pass.
    transport.arm_fault(URL, MIB, 4, true);

    let config = base_config(dir.path()).file_name("big.bin");
    let engine = engine_with(Arc::clone(&transport), config.clone());
    let outcome = engine.execute().await.unwrap();
    assert_eq!(outcome.state, CompletionState::Failed);

    // 10 MiB / 1 MiB pieces / 4 threads plans 4 chunks of 2.5 MiB; each one
    // persisted exactly 1 MiB of progress.
    let target = dir.path().join("big.bin");
    let sidecar = SessionStore::sidecar_path(&target, GENERIC_SIDECAR_EXT);
    let descriptor = SessionStore::load(&sidecar).await.unwrap();
    let status = descriptor.renew.as_ref().unwrap().status.clone();
    let expected: BTreeMap<u64, u64> = [
        (0, MIB as u64),
        (2621440, 2621440 + MIB as u64),
        (5242880, 5242880 + MIB as u64),
        (7864320, 7864320 + MIB as u64),
    ]
    .into_iter()
    .collect();
    assert_eq!(status, expected);
    assert_eq!(descriptor.renew.as_ref().unwrap().completed, (4 * MIB) as u64);

    // Second run: the faults are gone, the session resumes.
    transport.clear_faults();
    let first_run_requests = transport.request_count();
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();
    assert_eq!(outcome.state, CompletionState::Done);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
    assert!(!sidecar.exists());

    // Every bounded re-request starts exactly at its chunk's persisted
    // offset — never back at the chunk start.
    let resumed: Vec<_> = transport.requests()[first_run_requests..]
        .iter()
        .filter_map(|r| match r.range {
            Some((start, Some(end))) => Some((start, end)),
            _ => None,
        })
        .collect();
    assert_eq!(resumed.len(), 4);
    for (start, _) in &resumed {
        assert!(
            expected.values().any(|offset| offset == start),
            "request started at {} instead of a persisted offset",
            start
        );
    }
    // The worked example: the second chunk resumes with bytes=3670016-5242879.
    assert!(resumed.contains(&(3670016, 5242879)));
}

#[tokio::test]
async fn collision_short_circuit_issues_no_network_requests() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    transport.add_bytes(URL, payload(MIB, 3));

    // A finished download: target present, no sidecar.
    tokio::fs::write(dir.path().join("big.bin"), b"already here")
        .await
        .unwrap();

    let config = base_config(dir.path()).file_name("big.bin");
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::Done);
    assert_eq!(outcome.status_code, 200);
    assert_eq!(outcome.file_size, 12);
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn rename_on_collision_downloads_to_numbered_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(256 * 1024, 4);
    let transport = Arc::new(MockTransport::new());
    transport.add_bytes(URL, data.clone());

    tokio::fs::write(dir.path().join("big.bin"), b"old")
        .await
        .unwrap();

    let config = base_config(dir.path())
        .file_name("big.bin")
        .rename_on_collision(true);
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::Done);
    assert_eq!(outcome.final_path, dir.path().join("big - 1.bin"));
    assert_eq!(tokio::fs::read(&outcome.final_path).await.unwrap(), data);
    // The original file is untouched.
    assert_eq!(
        tokio::fs::read(dir.path().join("big.bin")).await.unwrap(),
        b"old"
    );
}

#[tokio::test]
async fn unknown_size_forces_single_stream() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(3 * MIB + 17, 5);
    let transport = Arc::new(MockTransport::new());
    let mut resource = Resource::new(data.clone());
    resource.range_support = false;
    resource.hide_length = true;
    transport.add_resource(URL, resource);

    let config = base_config(dir.path()).file_name("big.bin");
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::Done);
    assert_eq!(outcome.file_size, (3 * MIB + 17) as u64);
    assert_eq!(
        tokio::fs::read(dir.path().join("big.bin")).await.unwrap(),
        data
    );
    // Probe plus exactly one streaming request.
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn verification_mismatch_deletes_file_and_keeps_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    transport.add_bytes(URL, payload(64 * 1024, 6));

    let config = base_config(dir.path())
        .file_name("big.bin")
        .integrity_hash("0".repeat(32));
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::VerificationFailed);
    assert!(outcome.hash.is_some());
    assert!(!dir.path().join("big.bin").exists(), "corrupt file removed");

    let sidecar = SessionStore::sidecar_path(&dir.path().join("big.bin"), GENERIC_SIDECAR_EXT);
    assert!(sidecar.exists(), "sidecar stays for a later attempt");
}

#[tokio::test]
async fn verification_passes_with_correct_digest() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(64 * 1024, 7);
    let transport = Arc::new(MockTransport::new());
    transport.add_bytes(URL, data.clone());

    // Compute the expected digest from the source bytes.
    let reference = dir.path().join("reference.bin");
    tokio::fs::write(&reference, &data).await.unwrap();
    let digest = hash_file(&reference, HashAlgorithm::Md5).await.unwrap();

    let config = base_config(dir.path())
        .file_name("big.bin")
        .integrity_hash(digest.to_uppercase()); // comparison is case-insensitive
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::Done);
    let sidecar = SessionStore::sidecar_path(&outcome.final_path, GENERIC_SIDECAR_EXT);
    assert!(!sidecar.exists());
}

#[tokio::test]
async fn probe_failure_surfaces_last_status() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    // No resource registered: the mock answers 404.

    let config = base_config(dir.path()).file_name("big.bin");
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::Failed);
    assert_eq!(outcome.status_code, 404);
}

#[tokio::test]
async fn file_name_derived_from_content_disposition() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(128 * 1024, 8);
    let transport = Arc::new(MockTransport::new());
    let mut resource = Resource::new(data.clone());
    resource.headers.push((
        "content-disposition".to_string(),
        r#"attachment; filename="My:Report.pdf""#.to_string(),
    ));
    transport.add_resource(URL, resource);

    // No file-name override: the probe decides.
    let config = base_config(dir.path());
    let engine = engine_with(Arc::clone(&transport), config);
    let outcome = engine.execute().await.unwrap();

    assert_eq!(outcome.state, CompletionState::Done);
    assert_eq!(outcome.file_name, "My_Report.pdf");
    assert_eq!(
        tokio::fs::read(dir.path().join("My_Report.pdf"))
            .await
            .unwrap(),
        data
    );
}

#[tokio::test]
async fn fail_fast_turns_failures_into_errors() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());

    let config = base_config(dir.path()).file_name("big.bin").fail_fast(true);
    let engine = engine_with(Arc::clone(&transport), config);
    assert!(engine.execute().await.is_err());
}
