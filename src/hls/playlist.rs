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


//! Playlist resolution
//!
//! Line-oriented parsing of media playlists: tag lines start with `#`, every
//! other non-empty line is a segment URI resolved against the playlist URL.
//! When the text opens a variant section (`#EXT-X-STREAM-INF`), the caller's
//! predicate picks exactly one variant by inspecting its raw attribute line;
//! the resolver re-fetches that variant's playlist and recurses once.
//!
//! Key material from `#EXT-X-KEY` resolves with this precedence: a `URI`
//! attribute is fetched as an HTTP resource and passed through the caller's
//! key transform; otherwise a literal `KEY` attribute goes through the same
//! transform. Whatever comes out must be 16/24/32 alphanumeric characters —
//! anything else rejects the playlist outright, it is never retried.

use crate::error::{EngineError, Result};
use crate::transport::{Transport, TransportRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";
const KEY_TAG: &str = "#EXT-X-KEY:";

/// Transform applied to raw key material before it is used for decryption
pub type KeyTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Predicate over a variant's raw attribute line
pub type VariantSelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Segment encryption scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    None,
    Aes,
}

impl EncryptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMethod::None => "none",
            EncryptionMethod::Aes => "aes",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("aes") {
            EncryptionMethod::Aes
        } else {
            EncryptionMethod::None
        }
    }
}

/// A resolved playlist: ordered absolute segment URLs plus key material.
///
/// Segment order is the required final concatenation order; a segment's index
/// in `segments` doubles as its on-disk temp-file name.
#[derive(Debug, Clone)]
pub struct PlaylistDescriptor {
    pub segments: Vec<String>,
    /// Validated key string (16/24/32 alphanumeric characters)
    pub key: Option<String>,
    /// Hex IV without the `0x` prefix; 16 zero bytes when absent
    pub iv: Option<String>,
    pub method: EncryptionMethod,
}

impl PlaylistDescriptor {
    pub fn key_bytes(&self) -> Option<Vec<u8>> {
        self.key.as_ref().map(|k| k.as_bytes().to_vec())
    }

    pub fn iv_bytes(&self) -> Result<[u8; 16]> {
        let Some(iv) = &self.iv else {
            return Ok([0u8; 16]);
        };
        let raw = hex::decode(iv)
            .map_err(|_| EngineError::PlaylistRejected(format!("invalid IV: {}", iv)))?;
        raw.try_into()
            .map_err(|_| EngineError::PlaylistRejected("IV must be 16 bytes".to_string()))
    }
}

/// Fetches and parses playlists into a [`PlaylistDescriptor`]
pub struct PlaylistResolver {
    pub transport: Arc<dyn Transport>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub key_transform: Option<KeyTransform>,
    pub variant_selector: Option<VariantSelector>,
}

impl PlaylistResolver {
    /// Resolve `url` (or a raw `body` the caller already holds) into segments
    pub async fn resolve(&self, url: &str, body: Option<&str>) -> Result<PlaylistDescriptor> {
        let mut base = url.to_string();
        let mut text = match body {
            Some(raw) => raw.to_string(),
            None => self.fetch_text(&base).await?,
        };

        if is_master_playlist(&text) {
            let variant_uri = self.select_variant(&text)?;
            base = resolve_url(&base, &variant_uri)?;
            debug!(variant = %base, "selected variant stream");
            text = self.fetch_text(&base).await?;
            if is_master_playlist(&text) {
                return Err(EngineError::PlaylistRejected(
                    "variant playlist contains another variant section".to_string(),
                ));
            }
        }

        self.parse_media(&base, &text).await
    }

    /// Pick one variant URI via the caller's predicate (first variant when
    /// no predicate is configured). No match is a fatal configuration error.
    fn select_variant(&self, text: &str) -> Result<String> {
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        for (i, line) in lines.iter().enumerate() {
            let Some(attributes) = line.strip_prefix(STREAM_INF_TAG) else {
                continue;
            };
            let selected = match &self.variant_selector {
                Some(selector) => selector(attributes),
                None => true,
            };
            if !selected {
                continue;
            }
            // The variant's URI is the next non-tag line.
            for candidate in &lines[i + 1..] {
                if candidate.is_empty() || candidate.starts_with('#') {
                    continue;
                }
                return Ok(candidate.to_string());
            }
            return Err(EngineError::PlaylistRejected(
                "variant tag without a URI line".to_string(),
            ));
        }
        Err(EngineError::VariantNotSelected)
    }

    async fn parse_media(&self, base: &str, text: &str) -> Result<PlaylistDescriptor> {
        let mut segments = Vec::new();
        let mut key = None;
        let mut iv = None;
        let mut method = EncryptionMethod::None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(attributes) = line.strip_prefix(KEY_TAG) {
                (method, key, iv) = self.resolve_key(base, attributes).await?;
            } else if line.is_empty() || line.starts_with('#') {
                continue;
            } else {
                segments.push(resolve_url(base, line)?);
            }
        }

        if segments.is_empty() {
            return Err(EngineError::PlaylistRejected(
                "playlist holds no media segments".to_string(),
            ));
        }

        Ok(PlaylistDescriptor {
            segments,
            key,
            iv,
            method,
        })
    }

    /// Resolve an `#EXT-X-KEY` tag into validated key material
    async fn resolve_key(
        &self,
        base: &str,
        attributes: &str,
    ) -> Result<(EncryptionMethod, Option<String>, Option<String>)> {
        let mut method = EncryptionMethod::None;
        let mut uri = None;
        let mut literal = None;
        let mut iv = None;

        for (name, value) in parse_attributes(attributes) {
            match name.as_str() {
                "METHOD" => {
                    if value.eq_ignore_ascii_case("NONE") {
                        method = EncryptionMethod::None;
                    } else if value.to_ascii_uppercase().starts_with("AES") {
                        method = EncryptionMethod::Aes;
                    } else {
                        return Err(EngineError::PlaylistRejected(format!(
                            "unsupported encryption method: {}",
                            value
                        )));
                    }
                }
                "URI" => uri = Some(value),
                "KEY" => literal = Some(value),
                "IV" => {
                    let trimmed = value
                        .trim_start_matches("0x")
                        .trim_start_matches("0X")
                        .to_ascii_lowercase();
                    iv = Some(trimmed);
                }
                _ => {}
            }
        }

        if method == EncryptionMethod::None {
            return Ok((EncryptionMethod::None, None, None));
        }

        let raw = match (uri, literal) {
            (Some(uri), _) => {
                let key_url = resolve_url(base, &uri)?;
                self.fetch_bytes(&key_url).await?
            }
            (None, Some(literal)) => literal.into_bytes(),
            (None, None) => {
                return Err(EngineError::PlaylistRejected(
                    "key tag carries neither URI nor KEY".to_string(),
                ));
            }
        };

        let material = match &self.key_transform {
            Some(transform) => transform(raw),
            None => raw,
        };
        let key = validate_key(material)?;

        Ok((EncryptionMethod::Aes, Some(key), iv))
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let bytes = self.fetch_bytes(url).await?;
        String::from_utf8(bytes)
            .map_err(|_| EngineError::PlaylistRejected("playlist is not UTF-8".to_string()))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let request = TransportRequest::get(url)
            .with_headers(&self.headers)
            .with_cookies(&self.cookies);
        let response = self.transport.fetch(request).await?;
        if !crate::transport::is_success_status(response.status) {
            return Err(EngineError::UnexpectedStatus {
                status_code: response.status,
            });
        }
        response.into_bytes().await
    }
}

/// A resolved key must be 16/24/32 alphanumeric characters
fn validate_key(material: Vec<u8>) -> Result<String> {
    let text = String::from_utf8(material).map_err(|_| {
        EngineError::PlaylistRejected("key material is not printable text".to_string())
    })?;
    if !matches!(text.len(), 16 | 24 | 32) {
        return Err(EngineError::InvalidKeyLength(text.len()));
    }
    if !text.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::PlaylistRejected(
            "key material is not alphanumeric".to_string(),
        ));
    }
    Ok(text)
}

fn is_master_playlist(text: &str) -> bool {
    text.lines()
        .any(|line| line.trim_start().starts_with("#EXT-X-STREAM-INF"))
}

/// Make a playlist entry absolute against the playlist URL
fn resolve_url(base: &str, reference: &str) -> Result<String> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Ok(reference.to_string());
    }
    let base = url::Url::parse(base)
        .map_err(|e| EngineError::PlaylistRejected(format!("bad playlist URL {}: {}", base, e)))?;
    base.join(reference)
        .map(|joined| joined.to_string())
        .map_err(|e| EngineError::PlaylistRejected(format!("bad segment URI {}: {}", reference, e)))
}

/// Split an attribute line on commas, honoring quoted values
fn parse_attributes(line: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attributes_honors_quotes() {
        let attrs = parse_attributes(
            r#"METHOD=AES-128,URI="https://host/key?a=1,b=2",IV=0xABCDEF,BANDWIDTH=256000"#,
        );
        assert_eq!(
            attrs,
            vec![
                ("METHOD".to_string(), "AES-128".to_string()),
                ("URI".to_string(), "https://host/key?a=1,b=2".to_string()),
                ("IV".to_string(), "0xABCDEF".to_string()),
                ("BANDWIDTH".to_string(), "256000".to_string()),
            ]
        );
    }

    #[test]
    fn test_resolve_url_relative_and_absolute() {
        assert_eq!(
            resolve_url("https://host/live/playlist.m3u8", "seg0.ts").unwrap(),
            "https://host/live/seg0.ts"
        );
        assert_eq!(
            resolve_url("https://host/live/playlist.m3u8", "/media/seg0.ts").unwrap(),
            "https://host/media/seg0.ts"
        );
        assert_eq!(
            resolve_url("https://host/live/playlist.m3u8", "https://cdn/seg0.ts").unwrap(),
            "https://cdn/seg0.ts"
        );
    }

    #[test]
    fn test_validate_key_lengths() {
        assert_eq!(
            validate_key(b"0123456789abcdef".to_vec()).unwrap().len(),
            16
        );
        assert_eq!(
            validate_key(b"0123456789abcdef01234567".to_vec())
                .unwrap()
                .len(),
            24
        );
        assert!(matches!(
            validate_key(b"tooshort".to_vec()),
            Err(EngineError::InvalidKeyLength(8))
        ));
        assert!(matches!(
            validate_key(b"0123456789abcde!".to_vec()),
            Err(EngineError::PlaylistRejected(_))
        ));
    }

    #[test]
    fn test_iv_defaults_to_zero_bytes() {
        let descriptor = PlaylistDescriptor {
            segments: vec!["https://host/s0.ts".to_string()],
            key: None,
            iv: None,
            method: EncryptionMethod::None,
        };
        assert_eq!(descriptor.iv_bytes().unwrap(), [0u8; 16]);

        let with_iv = PlaylistDescriptor {
            iv: Some("000102030405060708090a0b0c0d0e0f".to_string()),
            ..descriptor
        };
        assert_eq!(
            with_iv.iv_bytes().unwrap(),
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }

    #[test]
    fn test_master_playlist_detection() {
        assert!(is_master_playlist(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n"
        ));
        assert!(!is_master_playlist("#EXTM3U\n#EXTINF:4,\nseg0.ts\n"));
    }
}
