//! In-memory transport for integration tests: range-aware, request-recording,
//! with optional one-shot fault injection to simulate dying connections.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use sion_dl::error::{EngineError, Result};
use sion_dl::transport::{Transport, TransportRequest, TransportResponse};
use std::collections::HashMap;
use std::sync::Mutex;

const BODY_CHUNK: usize = 8 * 1024;

#[derive(Clone)]
pub struct Resource {
    pub data: Vec<u8>,
    /// Extra response headers (content-disposition, content-md5, ...)
    pub headers: Vec<(String, String)>,
    /// Serve 206 for ranged requests; otherwise always 200 with the full body
    pub range_support: bool,
    /// Suppress content-length on 200 responses (unknown size)
    pub hide_length: bool,
}

impl Resource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            headers: Vec::new(),
            range_support: true,
            hide_length: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    /// (start, inclusive end) of the Range header, if any
    pub range: Option<(u64, Option<u64>)>,
}

struct Fault {
    /// Bytes delivered before the stream errors out
    deliver: usize,
    /// How many requests this fault still applies to
    remaining: u32,
    /// Only trip on bounded ranges (skips probes and open-ended streams)
    bounded_only: bool,
}

#[derive(Default)]
pub struct MockTransport {
    resources: Mutex<HashMap<String, Resource>>,
    requests: Mutex<Vec<RecordedRequest>>,
    faults: Mutex<HashMap<String, Fault>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&self, url: &str, resource: Resource) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), resource);
    }

    pub fn add_bytes(&self, url: &str, data: Vec<u8>) {
        self.add_resource(url, Resource::new(data));
    }

    /// Make the next `times` requests for `url` deliver `deliver` bytes and
    /// then fail with a transient network error.
    pub fn arm_fault(&self, url: &str, deliver: usize, times: u32, bounded_only: bool) {
        self.faults.lock().unwrap().insert(
            url.to_string(),
            Fault {
                deliver,
                remaining: times,
                bounded_only,
            },
        );
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn take_fault(&self, url: &str, bounded: bool) -> Option<usize> {
        let mut faults = self.faults.lock().unwrap();
        let fault = faults.get_mut(url)?;
        if fault.bounded_only && !bounded {
            return None;
        }
        if fault.remaining == 0 {
            return None;
        }
        fault.remaining -= 1;
        Some(fault.deliver)
    }
}

fn body_from(data: Vec<u8>, fail_after: Option<usize>) -> Vec<Result<Bytes>> {
    let cut = fail_after.unwrap_or(data.len()).min(data.len());
    let mut items: Vec<Result<Bytes>> = data[..cut]
        .chunks(BODY_CHUNK)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    if fail_after.is_some() {
        items.push(Err(EngineError::Network {
            message: "injected connection loss".to_string(),
            is_transient: true,
        }));
    }
    items
}

fn response(
    status: u16,
    headers: Vec<(String, String)>,
    url: &str,
    body: Vec<Result<Bytes>>,
) -> TransportResponse {
    TransportResponse {
        status,
        headers: headers.into_iter().collect(),
        cookies: HashMap::new(),
        final_url: url.to_string(),
        body: futures_util::stream::iter(body).boxed(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: TransportRequest) -> Result<TransportResponse> {
        let range = request.range.map(|r| (r.start, r.end));
        self.requests.lock().unwrap().push(RecordedRequest {
            url: request.url.clone(),
            range,
        });

        let resource = {
            let resources = self.resources.lock().unwrap();
            resources.get(&request.url).cloned()
        };
        let Some(resource) = resource else {
            return Ok(response(404, Vec::new(), &request.url, Vec::new()));
        };

        let total = resource.data.len() as u64;
        let mut headers = resource.headers.clone();

        if let (Some((start, end)), true) = (range, resource.range_support) {
            if start >= total {
                return Ok(response(416, headers, &request.url, Vec::new()));
            }
            let end = end.map(|e| e.min(total - 1)).unwrap_or(total - 1);
            let slice = resource.data[start as usize..=end as usize].to_vec();
            headers.push((
                "content-range".to_string(),
                format!("bytes {}-{}/{}", start, end, total),
            ));
            headers.push(("content-length".to_string(), slice.len().to_string()));
            let fail_after = self.take_fault(&request.url, range.map(|r| r.1.is_some()).unwrap_or(false));
            return Ok(response(
                206,
                headers,
                &request.url,
                body_from(slice, fail_after),
            ));
        }

        if !resource.hide_length {
            headers.push(("content-length".to_string(), total.to_string()));
        }
        let fail_after = self.take_fault(&request.url, false);
        Ok(response(
            200,
            headers,
            &request.url,
            body_from(resource.data, fail_after),
        ))
    }
}

/// Deterministic pseudo-random payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut state = seed as u32 | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 16) as u8
        })
        .collect()
}
