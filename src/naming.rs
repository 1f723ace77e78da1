//! File-name derivation and sanitization
//!
//! Names come from three places, in order: the caller override, the
//! `Content-Disposition` response header, and the URL tail. Whatever the
//! source, the result is made filesystem-safe (Windows-hostile characters
//! replaced, runs collapsed) and capped at 240 encoded bytes.

use crate::error::{EngineError, Result};
use lazy_static::lazy_static;
use regex::Regex;

/// Maximum UTF-8 encoded length of a file name
pub const MAX_FILE_NAME_BYTES: usize = 240;

const INVALID_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

lazy_static! {
    static ref UNDERSCORE_RUN: Regex = Regex::new("_{2,}").unwrap();
    static ref DISPOSITION_FILENAME: Regex =
        Regex::new(r#"filename\s*=\s*(?:"([^"]+)"|([^;]+))"#).unwrap();
}

/// Replace filesystem-hostile characters with `_` and collapse repeats
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if INVALID_CHARS.contains(&c) { '_' } else { c })
        .collect();
    UNDERSCORE_RUN
        .replace_all(&replaced, "_")
        .trim()
        .to_string()
}

/// Reject empty names and names over the encoded-byte cap
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::Configuration("empty file name".to_string()));
    }
    if name.len() > MAX_FILE_NAME_BYTES {
        return Err(EngineError::FileNameTooLong {
            name: name.to_string(),
            limit: MAX_FILE_NAME_BYTES,
        });
    }
    Ok(())
}

/// Extract the file name from a `Content-Disposition` header value
pub fn file_name_from_disposition(value: &str) -> Option<String> {
    let captures = DISPOSITION_FILENAME.captures(value)?;
    let raw = captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().trim())?;
    if raw.is_empty() {
        return None;
    }
    // Strip any path component a hostile server may have smuggled in.
    let tail = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    Some(tail.to_string())
}

/// Derive a file name from the tail of a URL, percent-decoded
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let tail = without_query.rsplit('/').next()?;
    if tail.is_empty() || tail.contains(':') {
        return None;
    }
    let decoded = urlencoding::decode(tail)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| tail.to_string());
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Build the N-th collision candidate: `name - N` inserted before the extension
pub fn numbered_candidate(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            format!("{} - {}{}", &name[..dot], n, &name[dot..])
        }
        _ => format!("{} - {}", name, n),
    }
}
