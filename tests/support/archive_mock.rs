//! wiremock fixtures shaped like the archive.org metadata and download APIs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use grabia_core::{ArchiveEndpoints, HttpClient, Mirror, RetryPolicy};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Mounts `/metadata/<item>` listing `files` with their sizes, and one
/// range-aware download route per file.
pub async fn mount_item(server: &MockServer, item_id: &str, files: &[(&str, &[u8])]) {
    let listing: Vec<_> = files
        .iter()
        .map(|(name, body)| json!({"name": name, "size": body.len().to_string()}))
        .collect();
    mount_metadata(server, item_id, json!({ "files": listing })).await;
    for (name, body) in files {
        mount_file(server, item_id, name, body).await;
    }
}

/// Mounts one range-aware download route.
pub async fn mount_file(server: &MockServer, item_id: &str, name: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/download/{item_id}/{name}")))
        .respond_with(RangeResponder::new(body))
        .mount(server)
        .await;
}

/// Mounts a raw metadata document for `item_id`.
pub async fn mount_metadata(server: &MockServer, item_id: &str, document: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/metadata/{item_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .mount(server)
        .await;
}

/// Number of requests the server saw under `/download/`.
pub async fn download_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().starts_with("/download/"))
        .count()
}

/// `Range` headers sent to the download routes, in arrival order.
pub async fn range_headers(server: &MockServer) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().starts_with("/download/"))
        .map(|request| {
            request
                .headers
                .get("range")
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        })
        .collect()
}

/// Serves `body`, honouring `Range: bytes=N-` with a 206.
pub struct RangeResponder {
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl RangeResponder {
    pub fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            delay: None,
        }
    }

    /// Same as `new`, but every response waits `delay` before its headers.
    pub fn delayed(body: &[u8], delay: Duration) -> Self {
        Self {
            body: body.to_vec(),
            delay: Some(delay),
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let start = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.trim_end_matches('-').parse::<usize>().ok());
        let template = match start {
            Some(start) if start >= self.body.len() => ResponseTemplate::new(416),
            Some(start) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{}/{}", self.body.len() - 1, self.body.len()),
                )
                .set_body_bytes(self.body[start..].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Fails the first `fail_count` requests with `status`, then serves `body`.
pub struct FlakyResponder {
    pub requests: Arc<AtomicUsize>,
    fail_count: usize,
    status: u16,
    body: Vec<u8>,
}

impl FlakyResponder {
    pub fn new(fail_count: usize, status: u16, body: &[u8]) -> Self {
        Self {
            requests: Arc::new(AtomicUsize::new(0)),
            fail_count,
            status,
            body: body.to_vec(),
        }
    }
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            ResponseTemplate::new(self.status)
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }
}

/// A facade pointed at the mock server with immediate retries.
pub fn mirror_for(server: &MockServer) -> Mirror {
    Mirror::new(
        HttpClient::new(),
        ArchiveEndpoints::with_root(&server.uri()).expect("mock uri is absolute"),
    )
    .with_retry_policy(RetryPolicy::immediate(3))
    .with_idle_timeout(Duration::from_secs(5))
    .with_scaling_interval(Duration::from_millis(50))
}
