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


//! Error types for the download engine
//!
//! Errors are categorized by domain so that callers can tell apart the three
//! classes that drive control flow:
//!
//! - **Configuration errors** (bad thread count, malformed file name,
//!   unusable playlist, bad key length) are fatal and never retried.
//! - **Transport errors** carry a transience flag; transient ones are retried
//!   per chunk from the last persisted offset.
//! - **Integrity errors** are retried at most once per unique observed digest,
//!   then escalated to fatal.

use thiserror::Error;

/// Result type alias using our EngineError type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the download engine
#[derive(Error, Debug)]
pub enum EngineError {
    // ===== Configuration Errors =====
    // Always fatal, surfaced immediately, never retried.

    /// Thread count must be at least 1
    #[error("invalid thread count: {0} (must be at least 1)")]
    InvalidThreadCount(usize),

    /// Generic configuration problem (bad piece size, impossible plan, ...)
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Sanitized file name exceeds the encoded-byte limit
    #[error("file name exceeds {limit} encoded bytes: {name}")]
    FileNameTooLong { name: String, limit: usize },

    // ===== Transport Errors =====
    // Reported by the Transport implementation; `is_transient` decides
    // whether a chunk worker may retry.

    /// Network connectivity error
    #[error("network error: {message}")]
    Network {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Server responded with a status code the engine cannot proceed on
    #[error("server responded with unexpected status code: {status_code}")]
    UnexpectedStatus { status_code: u16 },

    /// Download failed after retries were exhausted
    #[error("download failed: {0}")]
    DownloadFailed(String),

    // ===== Session / File Errors =====

    /// Underlying file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sidecar descriptor could not be read or written
    #[error("session file error: {0}")]
    Session(#[from] serde_json::Error),

    // ===== Integrity Errors =====

    /// Post-download hash verification failed
    #[error("integrity check failed: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Supplied hash has a length that maps to no known algorithm
    #[error("unrecognized integrity hash length: {0} (expected 32/40/64/96/128 hex chars)")]
    UnknownHashAlgorithm(usize),

    // ===== HLS Errors =====

    /// Playlist could not be parsed into a usable segment list
    #[error("malformed playlist: {0}")]
    PlaylistRejected(String),

    /// The variant-selection predicate matched no `#EXT-X-STREAM-INF` entry
    #[error("no variant stream matched the selection predicate")]
    VariantNotSelected,

    /// Resolved decryption key has an unusable length
    #[error("decryption key must be 16, 24 or 32 alphanumeric characters, got {0}")]
    InvalidKeyLength(usize),

    /// AES segment decryption failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

impl EngineError {
    /// Whether a chunk worker is allowed to retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Network {
                is_transient: true,
                ..
            } | EngineError::Io(_)
        )
    }
}
