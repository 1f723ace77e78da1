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


//! Resumable, concurrent download engine
//!
//! The engine splits a remote file into byte ranges, downloads them through a
//! bounded worker pool, and persists enough state in a sidecar file
//! (`<name>.sion`) to survive process restarts: every worker advances its own
//! entry in a shared progress map, retries resume from the last persisted
//! offset, and a resumed session re-requests only what is missing. An HLS
//! specialization applies the same machinery per playlist segment
//! (`<name>.hlsion`), with optional AES/CBC decryption and strict
//! index-order concatenation.
//!
//! # Example
//!
//! ```no_run
//! use sion_dl::{DownloadEngine, EngineConfig};
//!
//! # async fn example() -> sion_dl::Result<()> {
//! let config = EngineConfig::new("https://example.com/large.bin", "/downloads")
//!     .threads(4)
//!     .rename_on_collision(true);
//! let outcome = DownloadEngine::new(config)?.execute().await?;
//! println!("{} -> {}", outcome.status_code, outcome.final_path.display());
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod hls;
pub mod integrity;
pub mod naming;
pub mod planner;
pub mod progress;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{CheckpointHandle, CompletionState, DownloadEngine, DownloadOutcome};
pub use error::{EngineError, Result};
pub use hls::{HlsConfig, HlsDownloadEngine};
pub use planner::PlanMethod;
pub use progress::{ProgressEvent, ProgressListener};
pub use session::{SessionDescriptor, SessionStore};
pub use transport::{HttpTransport, Transport};
