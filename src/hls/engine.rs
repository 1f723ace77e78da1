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


//! HLS download orchestration
//!
//! Same state machine as the generic engine with the playlist resolver in
//! front and the segment assembler behind: segments are downloaded by index
//! through the shared worker pool (each with byte-level resume into its own
//! temp file), then concatenated in strict playlist order. The resolved
//! segment list, key and IV are persisted in the `.hlsion` sidecar so a
//! resumed session never re-fetches or re-selects the playlist.

use crate::chunk::{run_pool, ChunkJob, ChunkSpec, ChunkWorker, RetryPolicy};
use crate::engine::{
    resolve_target, spawn_checkpointer, CheckpointHandle, CompletionState, DownloadOutcome,
    TargetResolution,
};
use crate::error::{EngineError, Result};
use crate::hls::assembler::{parts_dir_for, SegmentAssembler};
use crate::hls::playlist::{EncryptionMethod, PlaylistDescriptor, PlaylistResolver};
use crate::hls::HlsConfig;
use crate::integrity::{self, HashAlgorithm};
use crate::naming;
use crate::planner::PlanMethod;
use crate::progress::{ProgressListener, ProgressReporter};
use crate::session::{
    LiveSession, SessionDescriptor, SessionProgress, SessionStore, HLS_SIDECAR_EXT,
};
use crate::transport::{HttpTransport, Transport, STATUS_OK};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Fallback name when neither the caller nor the playlist URL yields one
const FALLBACK_STREAM_NAME: &str = "stream.ts";

/// Playlist-driven downloader producing one concatenated output file
pub struct HlsDownloadEngine {
    config: HlsConfig,
    transport: Arc<dyn Transport>,
    listener: Option<ProgressListener>,
    active: Arc<RwLock<Option<Arc<LiveSession>>>>,
}

impl HlsDownloadEngine {
    pub fn new(config: HlsConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(
            config.engine.timeout,
            config.engine.proxy.as_deref(),
        )?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: HlsConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.engine.validate()?;
        Ok(Self {
            config,
            transport,
            listener: None,
            active: Arc::new(RwLock::new(None)),
        })
    }

    pub fn listener(mut self, listener: ProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn checkpoint_handle(&self) -> CheckpointHandle {
        CheckpointHandle::over(Arc::clone(&self.active))
    }

    /// Run the HLS session to a terminal state
    pub async fn execute(&self) -> Result<DownloadOutcome> {
        let config = &self.config.engine;
        config.validate()?;

        let raw_name = config
            .file_name
            .clone()
            .or_else(|| naming::file_name_from_url(&config.url))
            .unwrap_or_else(|| FALLBACK_STREAM_NAME.to_string());
        let file_name = naming::sanitize_file_name(&raw_name);
        naming::validate_file_name(&file_name)?;

        let target = match resolve_target(
            &config.target_dir,
            &file_name,
            HLS_SIDECAR_EXT,
            config.rename_on_collision,
        ) {
            TargetResolution::ShortCircuit(path) => {
                let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                info!(file = %path.display(), "target already exists, skipping download");
                return Ok(DownloadOutcome {
                    status_code: STATUS_OK,
                    state: CompletionState::Done,
                    final_path: path,
                    file_name,
                    file_size,
                    hash: config.integrity_hash.clone(),
                });
            }
            resolution => resolution.path().to_path_buf(),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sidecar = SessionStore::sidecar_path(&target, HLS_SIDECAR_EXT);
        let parts_dir = parts_dir_for(&target);

        let mut seen_bad_hashes: HashSet<String> = HashSet::new();

        loop {
            // RESUME from the persisted segment list, or resolve the playlist.
            let descriptor = match self.load_resumable(&sidecar).await? {
                Some(descriptor) => descriptor,
                None => {
                    let playlist = self.resolve_playlist().await?;
                    debug!(segments = playlist.segments.len(), "playlist resolved");
                    SessionDescriptor {
                        url: config.url.clone(),
                        file_name: file_name.clone(),
                        file_size: 0,
                        hash: config.integrity_hash.clone(),
                        threads: config.thread_count,
                        piece_size: config.piece_size_bytes(),
                        method: PlanMethod::Full,
                        headers: config.headers.clone(),
                        cookies: config.cookies.clone(),
                        saved_at: chrono::Utc::now().to_rfc3339(),
                        segments: Some(playlist.segments),
                        key: playlist.key,
                        iv: playlist.iv,
                        encryption: Some(playlist.method.as_str().to_string()),
                        renew: None,
                    }
                }
            };

            let segments = match descriptor.segments.clone() {
                Some(segments) => segments,
                None => {
                    return Err(EngineError::Configuration(
                        "session descriptor lost its segment list".to_string(),
                    ));
                }
            };
            let total = segments.len() as u64;
            tokio::fs::create_dir_all(&parts_dir).await?;
            let assembler = SegmentAssembler::new(parts_dir.clone());

            let progress = Arc::new(SessionProgress::new());
            match &descriptor.renew {
                Some(renew) => progress.restore(renew),
                None => {
                    for index in 0..total {
                        progress.seed(index, 0);
                    }
                }
            }
            // A segment counts as complete only while its temp file is still
            // there; anything consumed by an earlier half-finished assembly
            // must be fetched again.
            for index in 0..total {
                if !progress.is_pending(index) && !assembler.segment_path(index).exists() {
                    progress.seed(index, 0);
                }
            }
            let done = (0..total).filter(|i| !progress.is_pending(*i)).count() as u64;
            progress.set_units(done, total);

            let live = Arc::new(LiveSession {
                descriptor: descriptor.clone(),
                progress: Arc::clone(&progress),
                sidecar_path: sidecar.clone(),
            });
            live.checkpoint().await?;
            *self.active.write().await = Some(Arc::clone(&live));

            let reporter = self.listener.as_ref().map(|listener| {
                ProgressReporter {
                    file_name: descriptor.file_name.clone(),
                    total_size: 0,
                    progress: Arc::clone(&progress),
                    listener: Arc::clone(listener),
                    interval: config.report_interval,
                }
                .spawn()
            });
            let checkpointer = spawn_checkpointer(Arc::clone(&live));

            let jobs: Vec<ChunkJob> = (0..total)
                .filter(|index| progress.is_pending(*index))
                .map(|index| ChunkJob {
                    spec: ChunkSpec {
                        key: index,
                        start: 0,
                        end: 0,
                        open_ended: true,
                    },
                    url: segments[index as usize].clone(),
                    target: assembler.segment_path(index),
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
                if config.fail_fast {
                    return Err(EngineError::UnexpectedStatus {
                        status_code: status,
                    });
                }
                return Ok(DownloadOutcome {
                    status_code: status,
                    state: CompletionState::Failed,
                    final_path: target,
                    file_name: descriptor.file_name,
                    file_size: 0,
                    hash: None,
                });
            }
            *self.active.write().await = None;

            // All segments are on disk: decrypt and concatenate in order.
            let playlist = PlaylistDescriptor {
                segments: segments.clone(),
                key: descriptor.key.clone(),
                iv: descriptor.iv.clone(),
                method: descriptor
                    .encryption
                    .as_deref()
                    .map(EncryptionMethod::parse)
                    .unwrap_or(EncryptionMethod::None),
            };
            assembler.assemble(&playlist, &target).await?;

            let final_size = tokio::fs::metadata(&target)
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            // VERIFYING, same rules as the generic engine.
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

            SessionStore::delete(&sidecar).await?;
            info!(
                file = %target.display(),
                segments = total,
                size = final_size,
                "stream assembled"
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

    /// Load a sidecar that still carries a usable segment list
    async fn load_resumable(&self, sidecar: &PathBuf) -> Result<Option<SessionDescriptor>> {
        if !SessionStore::exists(sidecar) {
            return Ok(None);
        }
        let descriptor = SessionStore::load(sidecar).await?;
        if descriptor.segments.is_none() {
            // Unusable leftovers from a different engine kind; start over.
            SessionStore::delete(sidecar).await?;
            return Ok(None);
        }
        debug!(sidecar = %sidecar.display(), "resuming HLS session");
        Ok(Some(descriptor))
    }

    async fn resolve_playlist(&self) -> Result<PlaylistDescriptor> {
        let resolver = PlaylistResolver {
            transport: Arc::clone(&self.transport),
            headers: self.config.engine.headers.clone(),
            cookies: self.config.engine.cookies.clone(),
            key_transform: self.config.key_transform.clone(),
            variant_selector: self.config.variant_selector.clone(),
        };
        resolver
            .resolve(&self.config.engine.url, self.config.playlist_body.as_deref())
            .await
    }
}
