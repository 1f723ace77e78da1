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


//! Session persistence
//!
//! Every download is described by a sidecar JSON file next to the target
//! (`<name>.sion`, or `<name>.hlsion` for playlist sessions). Its presence is
//! what turns the next `execute()` into a resume instead of a fresh start, and
//! it is deleted only after the final integrity check passes.
//!
//! # Sidecar shape
//!
//! ```json
//! {
//!   "url": "https://host/file.bin",
//!   "fileName": "file.bin",
//!   "fileSize": 10485760,
//!   "hash": "d41d8cd98f00b204e9800998ecf8427e",
//!   "threads": 4,
//!   "pieceSize": 1048576,
//!   "method": "multithread",
//!   "header": {},
//!   "cookie": {},
//!   "savedAt": "2025-11-02T10:31:00Z",
//!   "renew": { "completed": 3145728, "status": { "2621440": 3670016 } }
//! }
//! ```
//!
//! `renew.status` is sparse: each planned chunk gets an entry at plan time
//! (value equal to its start offset) and the entry is removed the moment the
//! chunk reaches its end offset. A persisted descriptor therefore encodes
//! "complete" as absence — done chunks carry no state at all.

use crate::error::Result;
use crate::planner::PlanMethod;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Sidecar extension for generic downloads
pub const GENERIC_SIDECAR_EXT: &str = "sion";
/// Sidecar extension for HLS downloads
pub const HLS_SIDECAR_EXT: &str = "hlsion";

/// Resumable progress snapshot, present only while a download is incomplete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewState {
    /// Bytes transferred so far across all chunks
    pub completed: u64,
    /// Chunk start offset (or segment index) -> next write offset
    pub status: BTreeMap<u64, u64>,
}

/// The persisted, authoritative record of one download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub url: String,

    #[serde(rename = "fileName")]
    pub file_name: String,

    /// 0 means unknown, which forces single-stream mode
    #[serde(rename = "fileSize")]
    pub file_size: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,

    pub threads: usize,

    #[serde(rename = "pieceSize")]
    pub piece_size: u64,

    pub method: PlanMethod,

    #[serde(rename = "header", default)]
    pub headers: HashMap<String, String>,

    #[serde(rename = "cookie", default)]
    pub cookies: HashMap<String, String>,

    #[serde(rename = "savedAt")]
    pub saved_at: String,

    // HLS-only fields: the resolved segment list is persisted so a resumed
    // session never depends on the playlist still being reachable.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub segments: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iv: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encryption: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub renew: Option<RenewState>,
}

impl SessionDescriptor {
    pub fn touch(&mut self) {
        self.saved_at = chrono::Utc::now().to_rfc3339();
    }
}

/// Sidecar file reader/writer
pub struct SessionStore;

impl SessionStore {
    /// Sidecar path for a target file: the extension is appended, never
    /// substituted, so `a.bin` and `a - 1.bin` keep distinct sidecars.
    pub fn sidecar_path(target: &Path, extension: &str) -> PathBuf {
        let mut raw: OsString = target.as_os_str().to_os_string();
        raw.push(".");
        raw.push(extension);
        PathBuf::from(raw)
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub async fn load(path: &Path) -> Result<SessionDescriptor> {
        let json = tokio::fs::read_to_string(path).await?;
        let descriptor: SessionDescriptor = serde_json::from_str(&json)?;
        Ok(descriptor)
    }

    pub async fn save(path: &Path, descriptor: &SessionDescriptor) -> Result<()> {
        let json = serde_json::to_string_pretty(descriptor)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn delete(path: &Path) -> Result<()> {
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// Shared, concurrency-safe view of a running session's progress.
///
/// Workers only ever touch the map entry keyed by their own chunk, so no
/// cross-chunk locking exists; the reporter and checkpointing iterate the map
/// concurrently through `DashMap`'s sharded access.
#[derive(Debug, Default)]
pub struct SessionProgress {
    chunks: DashMap<u64, u64>,
    transferred: AtomicU64,
    units_done: AtomicU64,
    units_total: AtomicU64,
}

impl SessionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a planned chunk at its start offset
    pub fn seed(&self, key: u64, offset: u64) {
        self.chunks.insert(key, offset);
    }

    /// Record `written` new bytes landing, moving the chunk to `new_offset`
    pub fn advance(&self, key: u64, new_offset: u64, written: u64) {
        self.chunks.insert(key, new_offset);
        self.transferred.fetch_add(written, Ordering::Relaxed);
    }

    /// Drop the chunk's entry once it reached its end offset
    pub fn complete(&self, key: u64) {
        self.chunks.remove(&key);
        self.units_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Next write offset for a chunk; `None` once complete (or never seeded)
    pub fn offset(&self, key: u64) -> Option<u64> {
        self.chunks.get(&key).map(|entry| *entry)
    }

    pub fn is_pending(&self, key: u64) -> bool {
        self.chunks.contains_key(&key)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn units_done(&self) -> u64 {
        self.units_done.load(Ordering::Relaxed)
    }

    pub fn units_total(&self) -> u64 {
        self.units_total.load(Ordering::Relaxed)
    }

    pub fn set_units(&self, done: u64, total: u64) {
        self.units_done.store(done, Ordering::Relaxed);
        self.units_total.store(total, Ordering::Relaxed);
    }

    /// Snapshot for the sidecar's `renew` object
    pub fn snapshot(&self) -> RenewState {
        let status: BTreeMap<u64, u64> = self
            .chunks
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        RenewState {
            completed: self.transferred(),
            status,
        }
    }

    /// Restore from a persisted `renew` object
    pub fn restore(&self, renew: &RenewState) {
        self.chunks.clear();
        for (key, offset) in &renew.status {
            self.chunks.insert(*key, *offset);
        }
        self.transferred.store(renew.completed, Ordering::Relaxed);
    }
}

/// A session currently being downloaded, checkpointable at any moment
pub struct LiveSession {
    pub descriptor: SessionDescriptor,
    pub progress: std::sync::Arc<SessionProgress>,
    pub sidecar_path: PathBuf,
}

impl LiveSession {
    /// Persist the current chunk-progress map to the sidecar file
    pub async fn checkpoint(&self) -> Result<()> {
        let mut descriptor = self.descriptor.clone();
        descriptor.renew = Some(self.progress.snapshot());
        descriptor.touch();
        SessionStore::save(&self.sidecar_path, &descriptor).await?;
        debug!(
            sidecar = %self.sidecar_path.display(),
            completed = descriptor.renew.as_ref().map(|r| r.completed).unwrap_or(0),
            "session checkpointed"
        );
        Ok(())
    }
}
