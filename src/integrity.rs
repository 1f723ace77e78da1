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


//! Post-download integrity verification
//!
//! The algorithm is never configured explicitly: it is inferred from the
//! length of the supplied hex digest (32/40/64/96/128 characters map to
//! MD5/SHA-1/SHA-256/SHA-384/SHA-512). Comparison is case-insensitive.
//! A `Content-MD5` response header can seed the expected digest when the
//! caller supplies none.

use crate::error::{EngineError, Result};
use base64::Engine as _;
use sha2::Digest;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncReadExt;

const HASH_READ_BUF: usize = 64 * 1024;

/// Digest algorithm selected by digest length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Infer the algorithm from a hex digest; `None` if the string is not a
    /// hex digest of a recognized length.
    pub fn infer(hash: &str) -> Option<Self> {
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match hash.len() {
            32 => Some(HashAlgorithm::Md5),
            40 => Some(HashAlgorithm::Sha1),
            64 => Some(HashAlgorithm::Sha256),
            96 => Some(HashAlgorithm::Sha384),
            128 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Infer the algorithm, surfacing a configuration error on failure
    pub fn infer_required(hash: &str) -> Result<Self> {
        Self::infer(hash).ok_or(EngineError::UnknownHashAlgorithm(hash.len()))
    }
}

async fn hash_reader<D: Digest>(file: &mut tokio::fs::File) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_READ_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file with the given algorithm, returning lowercase hex
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    match algorithm {
        HashAlgorithm::Md5 => hash_reader::<md5::Md5>(&mut file).await,
        HashAlgorithm::Sha1 => hash_reader::<sha1::Sha1>(&mut file).await,
        HashAlgorithm::Sha256 => hash_reader::<sha2::Sha256>(&mut file).await,
        HashAlgorithm::Sha384 => hash_reader::<sha2::Sha384>(&mut file).await,
        HashAlgorithm::Sha512 => hash_reader::<sha2::Sha512>(&mut file).await,
    }
}

/// Case-insensitive digest comparison
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// Read an integrity hint from response headers.
///
/// `Content-MD5` carries the base64 of the raw 16-byte digest; it is decoded
/// to the 32-hex-char form the rest of the engine works with.
pub fn hint_from_headers(headers: &HashMap<String, String>) -> Option<String> {
    let value = headers.get("content-md5")?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .ok()?;
    if raw.len() != 16 {
        return None;
    }
    Some(hex::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_by_length() {
        assert_eq!(
            HashAlgorithm::infer(&"a".repeat(32)),
            Some(HashAlgorithm::Md5)
        );
        assert_eq!(
            HashAlgorithm::infer(&"b".repeat(40)),
            Some(HashAlgorithm::Sha1)
        );
        assert_eq!(
            HashAlgorithm::infer(&"c".repeat(64)),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(
            HashAlgorithm::infer(&"d".repeat(96)),
            Some(HashAlgorithm::Sha384)
        );
        assert_eq!(
            HashAlgorithm::infer(&"e".repeat(128)),
            Some(HashAlgorithm::Sha512)
        );
        assert_eq!(HashAlgorithm::infer(&"f".repeat(33)), None);
        assert_eq!(HashAlgorithm::infer(&"g".repeat(32)), None); // not hex
    }

    #[test]
    fn test_digests_match_ignores_case() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "abcde0"));
    }

    #[tokio::test]
    async fn test_hash_file_known_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert_eq!(
            hash_file(&path, HashAlgorithm::Md5).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha1).await.unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha256).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_md5_hint() {
        let mut headers = HashMap::new();
        // base64 of the MD5 of "abc"
        headers.insert(
            "content-md5".to_string(),
            "kAFQmDzST7DWlj99KOF/cg==".to_string(),
        );
        assert_eq!(
            hint_from_headers(&headers),
            Some("900150983cd24fb0d6963f7d28e17f72".to_string())
        );

        headers.insert("content-md5".to_string(), "not base64!!".to_string());
        assert_eq!(hint_from_headers(&headers), None);
    }
}
