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


//! Transport boundary
//!
//! The engine never talks HTTP directly; it consumes a [`Transport`] that can
//! issue a GET/HEAD with a `Range` header and hand back status, headers, a
//! cookie delta, the final (post-redirect) URL and a byte stream. The bundled
//! [`HttpTransport`] implements this over a shared `reqwest` client.
//!
//! Network failure is always surfaced as a transient [`EngineError::Network`];
//! workers map it to the 408 sentinel so a timeout is distinguishable from
//! every real server status and never reported as 0.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Successful whole-entity response
pub const STATUS_OK: u16 = 200;
/// Successful range response
pub const STATUS_PARTIAL_CONTENT: u16 = 206;
/// Sentinel for network-level failure (timeout, reset, refused)
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Requested range cannot be served
pub const STATUS_RANGE_NOT_SATISFIABLE: u16 = 416;

/// Whether a status counts as a successful chunk transfer
pub fn is_success_status(status: u16) -> bool {
    status == STATUS_OK || status == STATUS_PARTIAL_CONTENT
}

/// Streamed response body
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// Inclusive byte range for the `Range` request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end; `None` requests everything from `start` on
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn bounded(start: u64, end_inclusive: u64) -> Self {
        Self {
            start,
            end: Some(end_inclusive),
        }
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// One outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: RequestMethod,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub range: Option<ByteRange>,
}

impl TransportRequest {
    pub fn get<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            method: RequestMethod::Get,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Self {
        self.headers = headers.clone();
        self
    }

    pub fn with_cookies(mut self, cookies: &HashMap<String, String>) -> Self {
        self.cookies = cookies.clone();
        self
    }
}

/// One inbound response; header names are lowercase
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Cookies the server set on this exchange
    pub cookies: HashMap<String, String>,
    /// URL after redirects, used to resolve relative playlist entries
    pub final_url: String,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `Content-Length` of this response (not necessarily the entity size)
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Total entity size: the `/N` of `Content-Range`, else `Content-Length`
    pub fn total_size(&self) -> Option<u64> {
        if let Some(range) = self.header("content-range") {
            if let Some(total) = range.split('/').nth(1) {
                if let Ok(n) = total.trim().parse() {
                    return Some(n);
                }
            }
        }
        if self.status == STATUS_OK {
            self.content_length()
        } else {
            None
        }
    }

    /// Whether the server demonstrated or advertised range support
    pub fn supports_ranges(&self) -> bool {
        self.status == STATUS_PARTIAL_CONTENT
            || self.header("content-range").is_some()
            || self
                .header("accept-ranges")
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false)
    }

    /// Drain the body into memory (playlists, keys — never media)
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Anything able to satisfy ranged GET/HEAD requests
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| EngineError::Network {
                message: format!("invalid proxy {}: {}", proxy_url, e),
                is_transient: false,
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| EngineError::Network {
            message: format!("client construction failed: {}", e),
            is_transient: false,
        })?;

        Ok(Self { client })
    }
}

fn transient(e: reqwest::Error) -> EngineError {
    EngineError::Network {
        message: e.to_string(),
        is_transient: true,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut builder = match request.method {
            RequestMethod::Get => self.client.get(&request.url),
            RequestMethod::Head => self.client.head(&request.url),
        };

        for (key, value) in &request.headers {
            // The range is engine-controlled; a caller-supplied Range header
            // must not override it.
            if !key.eq_ignore_ascii_case("range") {
                builder = builder.header(key, value);
            }
        }

        if !request.cookies.is_empty() {
            let jar: Vec<String> = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            builder = builder.header("Cookie", jar.join("; "));
        }

        if let Some(range) = &request.range {
            builder = builder.header("Range", range.header_value());
        }

        let response = builder.send().await.map_err(transient)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers = HashMap::new();
        let mut cookies = HashMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else { continue };
            if name.as_str() == "set-cookie" {
                if let Some(pair) = value.split(';').next() {
                    if let Some((k, v)) = pair.split_once('=') {
                        cookies.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
            headers.insert(name.as_str().to_string(), value.to_string());
        }

        let body: BodyStream = response.bytes_stream().map_err(transient).boxed();

        Ok(TransportResponse {
            status,
            headers,
            cookies,
            final_url,
            body,
        })
    }
}
