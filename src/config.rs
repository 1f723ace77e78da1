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


//! Engine configuration
//!
//! One immutable configuration struct per engine instance. There is no
//! process-wide default state: everything a download needs (target, strategy,
//! retry policy, integrity expectations) travels in the `EngineConfig` handed
//! to the engine, and a resumed session's persisted strategy fields override
//! whatever the caller passes the second time around.

use crate::error::{EngineError, Result};
use crate::planner::PlanMethod;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Default worker pool size
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Default piece size in KiB (4 MiB)
pub const DEFAULT_PIECE_SIZE_KB: u64 = 4096;

/// Default number of retries per chunk
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default delay between chunk retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default progress sampling interval
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Default transport timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Download configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target URL (or playlist URL for HLS sessions)
    pub url: String,

    /// File name override; probed from the response when absent
    pub file_name: Option<String>,

    /// Directory the final file (and its sidecar) land in
    pub target_dir: PathBuf,

    /// Extra request headers sent with every request
    pub headers: HashMap<String, String>,

    /// Cookies sent with every request
    pub cookies: HashMap<String, String>,

    /// Range-planning strategy; unknown sizes force `Full`
    pub method: PlanMethod,

    /// Worker pool size (>= 1)
    pub thread_count: usize,

    /// Piece size in KiB for `Piece`/`Multithread` planning
    pub piece_size_kb: u64,

    /// Retries per chunk before the session aborts
    pub retry_count: u32,

    /// Sleep between chunk retries
    pub retry_delay: Duration,

    /// Retry forever instead of honoring `retry_count`
    pub unlimited_retry: bool,

    /// Additional HTTP status codes treated as retryable
    pub retryable_statuses: HashSet<u16>,

    /// Surface failures as `Err` instead of a failed outcome
    pub fail_fast: bool,

    /// Append " - N" on target collision instead of short-circuiting
    pub rename_on_collision: bool,

    /// Expected digest of the final file, hex; algorithm inferred from length
    pub integrity_hash: Option<String>,

    /// Run the post-download hash verification
    pub verify_integrity: bool,

    /// Proxy URL handed to the transport
    pub proxy: Option<String>,

    /// Transport timeout
    pub timeout: Duration,

    /// Interval at which the reporter samples the transferred-bytes counter
    pub report_interval: Duration,
}

impl EngineConfig {
    /// Create a configuration with defaults for everything but the essentials
    pub fn new<S: Into<String>, P: Into<PathBuf>>(url: S, target_dir: P) -> Self {
        Self {
            url: url.into(),
            file_name: None,
            target_dir: target_dir.into(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            method: PlanMethod::Multithread,
            thread_count: DEFAULT_THREAD_COUNT,
            piece_size_kb: DEFAULT_PIECE_SIZE_KB,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            unlimited_retry: false,
            retryable_statuses: HashSet::new(),
            fail_fast: false,
            rename_on_collision: false,
            integrity_hash: None,
            verify_integrity: true,
            proxy: None,
            timeout: DEFAULT_TIMEOUT,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn method(mut self, method: PlanMethod) -> Self {
        self.method = method;
        self
    }

    pub fn threads(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    pub fn piece_size_kb(mut self, kb: u64) -> Self {
        self.piece_size_kb = kb;
        self
    }

    pub fn retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn unlimited_retry(mut self, unlimited: bool) -> Self {
        self.unlimited_retry = unlimited;
        self
    }

    pub fn retryable_status(mut self, status: u16) -> Self {
        self.retryable_statuses.insert(status);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn rename_on_collision(mut self, rename: bool) -> Self {
        self.rename_on_collision = rename;
        self
    }

    pub fn integrity_hash<S: Into<String>>(mut self, hash: S) -> Self {
        self.integrity_hash = Some(hash.into());
        self
    }

    pub fn verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn cookie<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.cookies.insert(key.into(), value.into());
        self
    }

    /// Piece size in bytes
    pub fn piece_size_bytes(&self) -> u64 {
        self.piece_size_kb * 1024
    }

    /// Reject configurations the engine cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.thread_count < 1 {
            return Err(EngineError::InvalidThreadCount(self.thread_count));
        }
        if self.url.is_empty() {
            return Err(EngineError::Configuration("empty URL".to_string()));
        }
        if !self.method.is_sequential() && self.piece_size_kb == 0 {
            return Err(EngineError::Configuration(
                "piece size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
