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


//! HTTP-Live-Streaming specialization
//!
//! The HLS path substitutes a playlist resolver and a segment assembler ahead
//! of the same worker-pool, progress and session machinery the generic
//! downloader uses: each segment is fetched like a chunk (byte-level resume
//! included), written to a temp file named by its playlist index, optionally
//! AES-decrypted, and concatenated strictly in playlist order.

pub mod assembler;
pub mod engine;
pub mod playlist;

pub use assembler::SegmentAssembler;
pub use engine::HlsDownloadEngine;
pub use playlist::{
    EncryptionMethod, KeyTransform, PlaylistDescriptor, PlaylistResolver, VariantSelector,
};

use crate::config::EngineConfig;

/// Configuration of one HLS session
#[derive(Clone)]
pub struct HlsConfig {
    /// Shared engine options; `url` points at the playlist
    pub engine: EngineConfig,

    /// Raw playlist body, skipping the initial fetch
    pub playlist_body: Option<String>,

    /// Transform applied to fetched or literal key material before use
    pub key_transform: Option<KeyTransform>,

    /// Predicate over the raw `#EXT-X-STREAM-INF` attribute line; the first
    /// matching variant is selected. Absent means "take the first variant".
    pub variant_selector: Option<VariantSelector>,
}

impl HlsConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            playlist_body: None,
            key_transform: None,
            variant_selector: None,
        }
    }

    pub fn playlist_body<S: Into<String>>(mut self, body: S) -> Self {
        self.playlist_body = Some(body.into());
        self
    }

    pub fn key_transform(mut self, transform: KeyTransform) -> Self {
        self.key_transform = Some(transform);
        self
    }

    pub fn variant_selector(mut self, selector: VariantSelector) -> Self {
        self.variant_selector = Some(selector);
        self
    }
}
