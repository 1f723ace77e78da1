// SionDL - Resumable Concurrent Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Download orchestration
//!
//! `DownloadEngine::execute()` walks the session through
//! `PROBE -> (NEW | RESUME) -> DOWNLOADING -> VERIFYING -> DONE | FAILED`:
//!
//! - **PROBE** issues one ranged GET to learn size, file name
//!   (`Content-Disposition`, then URL tail), range support and an optional
//!   integrity hint.
//! - **NEW** plans the chunks and persists the initial sidecar; **RESUME**
//!   loads the sidecar verbatim — its strategy fields override whatever the
//!   caller passed this time, so a resumed session is never replanned
//!   inconsistently.
//! - **DOWNLOADING** hands all incomplete chunks to the bounded pool.
//! - **VERIFYING** hashes the assembled file; a mismatch is retried once per
//!   unique observed digest when unlimited retries are on, otherwise it is a
//!   distinct verification failure and the corrupt file is removed.
//!
//! The sidecar is deleted only after verification passes. On failure it stays
//! behind so the next `execute()` resumes every completed chunk. A
//! [`CheckpointHandle`] lets a host signal handler persist the live progress
//! map at any instant before teardown.

use crate::chunk::{run_pool, ChunkJob, ChunkSpec, ChunkWorker, RetryPolicy};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::integrity::{self, HashAlgorithm};
use crate::naming;
use crate::planner;
use crate::progress::{ProgressListener, ProgressReporter};
use crate::session::{
    LiveSession, SessionDescriptor, SessionProgress, SessionStore, GENERIC_SIDECAR_EXT,
};
use crate::transport::{
    ByteRange, HttpTransport, Transport, TransportRequest, STATUS_OK, STATUS_PARTIAL_CONTENT,
    STATUS_REQUEST_TIMEOUT,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// Interval of the opportunistic sidecar checkpointer
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Fallback file name when neither the caller nor the server provides one
const FALLBACK_FILE_NAME: &str = "download";

/// Terminal state of one `execute()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// File fully downloaded and verified
    Done,
    /// A chunk exhausted its retries or the probe failed
    Failed,
    /// Download completed but the integrity hash did not match
    VerificationFailed,
}

/// Result object returned by `execute()`
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Last observed status code (408 sentinel for network failure)
    pub status_code: u16,
    pub state: CompletionState,
    pub final_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    /// Verified (or expected) digest of the final file
    pub hash: Option<String>,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        self.state == CompletionState::Done
    }
}

/// Cloneable handle for host-driven "checkpoint now" requests.
///
/// A process signal handler can call [`CheckpointHandle::checkpoint`] before
/// teardown; an external kill then loses at most the unflushed writes of that
/// instant.
#[derive(Clone)]
pub struct CheckpointHandle {
    active: Arc<RwLock<Option<Arc<LiveSession>>>>,
}

impl CheckpointHandle {
    pub(crate) fn over(active: Arc<RwLock<Option<Arc<LiveSession>>>>) -> Self {
        Self { active }
    }

    /// Persist the live progress map; returns false when no session is active
    pub async fn checkpoint(&self) -> Result<bool> {
        match self.active.read().await.as_ref() {
            Some(session) => {
                session.checkpoint().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Where a download should land, given the collision policy
pub(crate) enum TargetResolution {
    /// No file and no sidecar: start fresh
    Fresh(PathBuf),
    /// A sidecar exists: resume that session
    Resume(PathBuf),
    /// Target exists without a sidecar and renaming is off
    ShortCircuit(PathBuf),
}

impl TargetResolution {
    pub(crate) fn path(&self) -> &Path {
        match self {
            TargetResolution::Fresh(p)
            | TargetResolution::Resume(p)
            | TargetResolution::ShortCircuit(p) => p,
        }
    }
}

/// Apply the collision policy for `name` inside `dir`.
///
/// With renaming on, " - N" candidates are probed in order; a candidate with
/// a stale sidecar is resumed instead of skipped, so an interrupted renamed
/// download is picked up rather than shadowed by yet another name.
pub(crate) fn resolve_target(
    dir: &Path,
    name: &str,
    sidecar_ext: &str,
    rename_on_collision: bool,
) -> TargetResolution {
    let target = dir.join(name);
    if SessionStore::exists(&SessionStore::sidecar_path(&target, sidecar_ext)) {
        return TargetResolution::Resume(target);
    }
    if !target.exists() {
        return TargetResolution::Fresh(target);
    }
    if !rename_on_collision {
        return TargetResolution::ShortCircuit(target);
    }

    for n in 1u32.. {
        let candidate = dir.join(naming::numbered_candidate(name, n));
        if SessionStore::exists(&SessionStore::sidecar_path(&candidate, sidecar_ext)) {
            return TargetResolution::Resume(candidate);
        }
        if !candidate.exists() {
            return TargetResolution::Fresh(candidate);
        }
    }
    unreachable!("collision candidates are unbounded")
}

/// What the probe learned about the target
struct ProbeResult {
    status: u16,
    /// 0 when the server did not reveal a size
    total_size: u64,
    file_name: Option<String>,
    hash_hint: Option<String>,
    supports_ranges: bool,
}

/// Resumable, concurrent downloader for one target URL
pub struct DownloadEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    listener: Option<ProgressListener>,
    active: Arc<RwLock<Option<Arc<LiveSession>>>>,
}

impl DownloadEngine {
    /// Create an engine with the bundled reqwest transport
    pub fn new(config: EngineConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.timeout, config.proxy.as_deref())?);
        Self::with_transport(config, transport)
    }

    /// Create an engine over a caller-supplied transport
    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            listener: None,
            active: Arc::new(RwLock::new(None)),
        })
    }

    /// Attach a progress listener sampled on the configured interval
    pub fn listener(mut self, listener: ProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Handle for host-driven checkpointing (signal handlers, shutdown paths)
    pub fn checkpoint_handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            active: Arc::clone(&self.active),
        }
    }

    /// Run the download to a terminal state
    pub async fn execute(&self) -> Result<DownloadOutcome> {
        let config = &self.config;
        config.validate()?;

        // Collision handling first when the name needs no probe: a second
        // call against an already-downloaded target returns without issuing
        // any network request.
        let mut resolved: Option<(String, TargetResolution)> = None;
        if let Some(name_override) = &config.file_name {
            let name = naming::sanitize_file_name(name_override);
            naming::validate_file_name(&name)?;
            match resolve_target(
                &config.target_dir,
                &name,
                GENERIC_SIDECAR_EXT,
                config.rename_on_collision,
            ) {
                TargetResolution::ShortCircuit(path) => {
                    return self.already_complete(path, name);
                }
                resolution => resolved = Some((name, resolution)),
            }
        }

        // PROBE
        let probe = match self.probe().await {
            Ok(probe) => probe,
            Err(e @ EngineError::Network { .. }) => {
                warn!("probe failed: {}", e);
                let name = resolved
                    .as_ref()
                    .map(|(n, _)| n.clone())
                    .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
                let path = config.target_dir.join(&name);
                return self.failed(STATUS_REQUEST_TIMEOUT, path, name);
            }
            Err(e) => return Err(e),
        };
        if probe.status != STATUS_OK && probe.status != STATUS_PARTIAL_CONTENT {
            let name = resolved
                .as_ref()
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
            let path = config.target_dir.join(&name);
            return self.failed(probe.status, path, name);
        }

        // Name and collision resolution for the probed case.
        let (file_name, resolution) = match resolved {
            Some(pair) => pair,
            None => {
                let derived = probe
                    .file_name
                    .clone()
                    .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
                let name = naming::sanitize_file_name(&derived);
                naming::validate_file_name(&name)?;
                match resolve_target(
                    &config.target_dir,
                    &name,
                    GENERIC_SIDECAR_EXT,
                    config.rename_on_collision,
                ) {
                    TargetResolution::ShortCircuit(path) => {
                        return self.already_complete(path, name);
                    }
                    resolution => (name, resolution),
                }
            }
        };

        let target = resolution.path().to_path_buf();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sidecar = SessionStore::sidecar_path(&target, GENERIC_SIDECAR_EXT);

        // Unknown sizes and range-less servers force single-stream mode.
        let method = if probe.total_size == 0 || !probe.supports_ranges {
            crate::planner::PlanMethod::Full
        } else {
            config.method
        };
        let expected_hash = config.integrity_hash.clone().or(probe.hash_hint);

        let mut seen_bad_hashes: HashSet<String> = HashSet::new();

        loop {
            // NEW | RESUME
            let descriptor = if SessionStore::exists(&sidecar) {
                let mut descriptor = SessionStore::load(&sidecar).await?;
                if !target.exists() {
                    // The data file vanished under a stale sidecar; nothing
                    // recorded there can be trusted.
                    descriptor.renew = None;
                }
                debug!(sidecar = %sidecar.display(), "resuming session");
                descriptor
            } else {
                SessionDescriptor {
                    url: config.url.clone(),
                    file_name: file_name.clone(),
                    file_size: probe.total_size,
                    hash: expected_hash.clone(),
                    threads: config.thread_count,
                    piece_size: config.piece_size_bytes(),
                    method,
                    headers: config.headers.clone(),
                    cookies: config.cookies.clone(),
                    saved_at: chrono::Utc::now().to_rfc3339(),
                    segments: None,
                    key: None,
                    iv: None,
                    encryption: None,
                    renew: None,
                }
            };

            let ranges = planner::plan(
                descriptor.file_size,
                descriptor.method,
                descriptor.threads,
                descriptor.piece_size,
            )?;

            let progress = Arc::new(SessionProgress::new());
            match &descriptor.renew {
                Some(renew) => progress.restore(renew),
                None => {
                    for range in &ranges {
                        progress.seed(range.start, range.start);
                    }
                }
            }
            let done = ranges
                .iter()
                .filter(|r| !progress.is_pending(r.start))
                .count() as u64;
            progress.set_units(done, ranges.len() as u64);

            let live = Arc::new(LiveSession {
                descriptor: descriptor.clone(),
                progress: Arc::clone(&progress),
                sidecar_path: sidecar.clone(),
            });
            live.checkpoint().await?;
            *self.active.write().await = Some(Arc::clone(&live));

            // DOWNLOADING
            let reporter = self.listener.as_ref().map(|listener| {
                ProgressReporter {
                    file_name: descriptor.file_name.clone(),
                    total_size: descriptor.file_size,
                    progress: Arc::clone(&progress),
                    listener: Arc::clone(listener),
                    interval: config.report_interval,
                }
                .spawn()
            });
            let checkpointer = spawn_checkpointer(Arc::clone(&live));

            let jobs: Vec<ChunkJob> = ranges
                .iter()
                .filter(|range| progress.is_pending(range.start))
                .map(|range| ChunkJob {
                    spec: ChunkSpec {
                        key: range.start,
                        start: range.start,
                        end: range.end,
                        open_ended: descriptor.method.is_sequential() || range.end == 0,
                    },
                    url: descriptor.url.clone(),
                    target: target.clone(),
                })
                .collect();

            let worker = ChunkWorker {
                transport: Arc::clone(&self.transport),
                headers: descriptor.headers.clone(),
                cookies: descriptor.cookies.clone(),
                retry: RetryPolicy::from_config(config),
                progress: Arc::clone(&progress),
            };
            let pool = run_pool(worker, jobs, descriptor.threads).await;

            checkpointer.stop().await;
            if let Some(reporter) = reporter {
                reporter.stop().await;
            }

            if let Some(status) = pool.failure {
                live.checkpoint().await?;
                *self.active.write().await = None;
                return self.failed(status, target, descriptor.file_name);
            }
            *self.active.write().await = None;

            // VERIFYING
            let final_size = tokio::fs::metadata(&target)
                .await
                .map(|m| m.len())
                .unwrap_or(descriptor.file_size);

            if config.verify_integrity {
                if let Some(expected) = &descriptor.hash {
                    let algorithm = HashAlgorithm::infer_required(expected)?;
                    let actual = integrity::hash_file(&target, algorithm).await?;
                    if !integrity::digests_match(expected, &actual) {
                        tokio::fs::remove_file(&target).await?;
                        if config.unlimited_retry && seen_bad_hashes.insert(actual.clone()) {
                            warn!(
                                %expected,
                                %actual,
                                "integrity mismatch, restarting the session once"
                            );
                            SessionStore::delete(&sidecar).await?;
                            continue;
                        }
                        if config.fail_fast {
                            return Err(EngineError::HashMismatch {
                                expected: expected.clone(),
                                actual,
                            });
                        }
                        return Ok(DownloadOutcome {
                            status_code: pool.last_success,
                            state: CompletionState::VerificationFailed,
                            final_path: target,
                            file_name: descriptor.file_name,
                            file_size: final_size,
                            hash: Some(actual),
                        });
                    }
                }
            }

            // DONE
            SessionStore::delete(&sidecar).await?;
            info!(
                file = %target.display(),
                size = final_size,
                "download complete"
            );
            return Ok(DownloadOutcome {
                status_code: pool.last_success,
                state: CompletionState::Done,
                final_path: target,
                file_name: descriptor.file_name,
                file_size: final_size,
                hash: descriptor.hash,
            });
        }
    }

    /// Issue the probe request and read everything the headers reveal
    async fn probe(&self) -> Result<ProbeResult> {
        let request = TransportRequest::get(&self.config.url)
            .with_headers(&self.config.headers)
            .with_cookies(&self.config.cookies)
            .with_range(ByteRange::open(0));
        let response = self.transport.fetch(request).await?;

        let file_name = response
            .header("content-disposition")
            .and_then(naming::file_name_from_disposition)
            .or_else(|| naming::file_name_from_url(&response.final_url));

        Ok(ProbeResult {
            status: response.status,
            total_size: response.total_size().unwrap_or(0),
            file_name,
            hash_hint: integrity::hint_from_headers(&response.headers),
            supports_ranges: response.supports_ranges(),
        })
        // The probe body is dropped here without being read.
    }

    /// Idempotent short-circuit: the target already holds a finished download
    fn already_complete(&self, path: PathBuf, file_name: String) -> Result<DownloadOutcome> {
        let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!(file = %path.display(), "target already exists, skipping download");
        Ok(DownloadOutcome {
            status_code: STATUS_OK,
            state: CompletionState::Done,
            final_path: path,
            file_name,
            file_size,
            hash: self.config.integrity_hash.clone(),
        })
    }

    fn failed(&self, status: u16, path: PathBuf, file_name: String) -> Result<DownloadOutcome> {
        if self.config.fail_fast {
            return Err(EngineError::UnexpectedStatus {
                status_code: status,
            });
        }
        Ok(DownloadOutcome {
            status_code: status,
            state: CompletionState::Failed,
            final_path: path,
            file_name,
            file_size: 0,
            hash: None,
        })
    }
}

/// Handle to the opportunistic checkpoint task
pub(crate) struct CheckpointerHandle {
    stop_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl CheckpointerHandle {
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
    }
}

/// Persist the live session every few seconds while the pool runs
pub(crate) fn spawn_checkpointer(live: Arc<LiveSession>) -> CheckpointerHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = live.checkpoint().await {
                        warn!("periodic checkpoint failed: {}", e);
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
    });
    CheckpointerHandle { stop_tx, handle }
}
