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


//! Chunk workers and the bounded pool
//!
//! One worker downloads one byte range (or one HLS segment) with positioned
//! writes straight into the target file — the body is never buffered whole.
//! After every write the worker advances its own entry in the shared progress
//! map and bumps the session counter, so a retry — or a whole new process —
//! always restarts from the last persisted offset, never from the chunk start.
//!
//! The pool runs `thread_count` workers at a time. The first chunk that
//! exhausts its retries flips the abort flag: chunks that have not started
//! yet return immediately, chunks already streaming finish their current
//! attempt and keep their progress.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::session::SessionProgress;
use crate::transport::{
    is_success_status, ByteRange, Transport, TransportRequest, STATUS_OK, STATUS_PARTIAL_CONTENT,
    STATUS_REQUEST_TIMEOUT,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Per-chunk retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub unlimited: bool,
    pub retryable_statuses: std::collections::HashSet<u16>,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            retry_delay: config.retry_delay,
            unlimited: config.unlimited_retry,
            retryable_statuses: config.retryable_statuses.clone(),
        }
    }

    fn allows_another(&self, attempts_so_far: u32) -> bool {
        self.unlimited || attempts_so_far < self.retry_count
    }

    fn status_retryable(&self, status: u16) -> bool {
        status == STATUS_REQUEST_TIMEOUT || self.retryable_statuses.contains(&status)
    }
}

/// One unit of ranged work.
///
/// For generic downloads `key == start` (the chunk's first byte) and offsets
/// are absolute positions in the target file. For HLS segments `key` is the
/// segment index, `start == 0` and offsets are positions in the segment's
/// temp file. `end == 0` together with `open_ended` means the size is unknown
/// and the body is streamed to EOF.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSpec {
    pub key: u64,
    pub start: u64,
    /// Exclusive end offset, 0 when unknown
    pub end: u64,
    /// Stream with `Range: bytes=<resume>-` instead of a bounded range
    pub open_ended: bool,
}

/// A spec bound to its source URL and destination file
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub spec: ChunkSpec,
    pub url: String,
    pub target: PathBuf,
}

struct ChunkFailure {
    status: u16,
    transient: bool,
    message: String,
}

impl ChunkFailure {
    fn network(message: String) -> Self {
        Self {
            status: STATUS_REQUEST_TIMEOUT,
            transient: true,
            message,
        }
    }
}

/// Downloads one chunk, retrying from the last persisted offset
#[derive(Clone)]
pub struct ChunkWorker {
    pub transport: Arc<dyn Transport>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub retry: RetryPolicy,
    pub progress: Arc<SessionProgress>,
}

impl ChunkWorker {
    /// Run the job to completion or retry exhaustion.
    ///
    /// Returns the final status: `200`/`206` on success, otherwise the last
    /// observed status code (network failure reports the request-timeout
    /// sentinel, never 0).
    pub async fn run(&self, job: &ChunkJob) -> u16 {
        let mut attempts = 0u32;

        loop {
            match self.attempt(job).await {
                Ok(status) => {
                    self.progress.complete(job.spec.key);
                    return status;
                }
                Err(failure) => {
                    let retryable =
                        failure.transient || self.retry.status_retryable(failure.status);
                    if retryable && self.retry.allows_another(attempts) {
                        attempts += 1;
                        debug!(
                            chunk = job.spec.key,
                            attempt = attempts,
                            status = failure.status,
                            "chunk attempt failed, retrying from persisted offset: {}",
                            failure.message
                        );
                        tokio::time::sleep(self.retry.retry_delay).await;
                        continue;
                    }
                    warn!(
                        chunk = job.spec.key,
                        status = failure.status,
                        "chunk failed permanently: {}",
                        failure.message
                    );
                    return failure.status;
                }
            }
        }
    }

    /// One transfer attempt, resuming at the chunk's recorded offset
    async fn attempt(&self, job: &ChunkJob) -> std::result::Result<u16, ChunkFailure> {
        let spec = &job.spec;
        let resume = self.progress.offset(spec.key).unwrap_or(spec.start);

        if spec.end > 0 && resume >= spec.end {
            return Ok(STATUS_PARTIAL_CONTENT);
        }

        let range = if spec.open_ended || spec.end == 0 {
            ByteRange::open(resume)
        } else {
            ByteRange::bounded(resume, spec.end - 1)
        };

        let request = TransportRequest::get(&job.url)
            .with_headers(&self.headers)
            .with_cookies(&self.cookies)
            .with_range(range);

        let response = self
            .transport
            .fetch(request)
            .await
            .map_err(|e| match e {
                EngineError::Network {
                    message,
                    is_transient,
                } => ChunkFailure {
                    status: STATUS_REQUEST_TIMEOUT,
                    transient: is_transient,
                    message,
                },
                other => ChunkFailure::network(other.to_string()),
            })?;

        match response.status {
            STATUS_PARTIAL_CONTENT => {}
            // A whole-entity answer only lines up with the file when the
            // transfer starts at byte zero.
            STATUS_OK if resume == 0 => {}
            status => {
                return Err(ChunkFailure {
                    status,
                    transient: false,
                    message: format!("unexpected status for range {}", range.header_value()),
                });
            }
        }
        let status = response.status;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&job.target)
            .await
            .map_err(|e| ChunkFailure::network(format!("open failed: {}", e)))?;
        file.seek(SeekFrom::Start(resume))
            .await
            .map_err(|e| ChunkFailure::network(format!("seek failed: {}", e)))?;

        let mut pos = resume;
        let mut body = response.body;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ChunkFailure::network(e.to_string()))?;
            let mut data = &chunk[..];

            // Never write past the chunk boundary, even if the server sends
            // more than the requested range.
            if spec.end > 0 {
                let room = (spec.end - pos) as usize;
                if data.len() > room {
                    data = &data[..room];
                }
            }
            if data.is_empty() {
                break;
            }

            file.write_all(data)
                .await
                .map_err(|e| ChunkFailure::network(format!("write failed: {}", e)))?;

            pos += data.len() as u64;
            self.progress.advance(spec.key, pos, data.len() as u64);

            if spec.end > 0 && pos >= spec.end {
                break;
            }
        }

        file.flush()
            .await
            .map_err(|e| ChunkFailure::network(format!("flush failed: {}", e)))?;

        if spec.end > 0 && pos < spec.end {
            return Err(ChunkFailure::network(format!(
                "stream ended early at {} of {}",
                pos, spec.end
            )));
        }

        Ok(status)
    }
}

/// Result of one pool run
pub struct PoolOutcome {
    /// Status of the first permanently failed chunk, if any
    pub failure: Option<u16>,
    /// Status of the last successful chunk
    pub last_success: u16,
}

impl PoolOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run all jobs through a bounded pool of `thread_count` workers.
///
/// The first permanent chunk failure aborts chunks that have not started;
/// running chunks finish their current attempt and keep their progress.
pub async fn run_pool(worker: ChunkWorker, jobs: Vec<ChunkJob>, thread_count: usize) -> PoolOutcome {
    let semaphore = Arc::new(Semaphore::new(thread_count.max(1)));
    let abort = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(jobs.len());
    for job in jobs {
        let worker = worker.clone();
        let semaphore = Arc::clone(&semaphore);
        let abort = Arc::clone(&abort);

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            if abort.load(Ordering::Relaxed) {
                return None;
            }
            let status = worker.run(&job).await;
            if !is_success_status(status) {
                abort.store(true, Ordering::Relaxed);
            }
            Some(status)
        }));
    }

    let mut failure = None;
    let mut last_success = STATUS_OK;
    for handle in handles {
        match handle.await {
            Ok(Some(status)) if is_success_status(status) => last_success = status,
            Ok(Some(status)) => failure = failure.or(Some(status)),
            Ok(None) => {}
            Err(_) => failure = failure.or(Some(STATUS_REQUEST_TIMEOUT)),
        }
    }

    PoolOutcome {
        failure,
        last_success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retry_count: 2,
            retry_delay: Duration::from_millis(1),
            unlimited: false,
            retryable_statuses: std::collections::HashSet::from([503]),
        }
    }

    #[test]
    fn test_retry_budget() {
        let p = policy();
        assert!(p.allows_another(0));
        assert!(p.allows_another(1));
        assert!(!p.allows_another(2));

        let unlimited = RetryPolicy {
            unlimited: true,
            ..policy()
        };
        assert!(unlimited.allows_another(u32::MAX - 1));
    }

    #[test]
    fn test_status_retryability() {
        let p = policy();
        assert!(p.status_retryable(STATUS_REQUEST_TIMEOUT));
        assert!(p.status_retryable(503));
        assert!(!p.status_retryable(404));
        assert!(!p.status_retryable(200));
    }
}
