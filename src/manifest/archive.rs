//! archive.org metadata API resolver.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{ArchiveEndpoints, ManifestError, ManifestResolver, RemoteFile};
use crate::download::HttpClient;

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    files: Option<Vec<MetadataFile>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default)]
    format: Option<String>,
}

/// Declared sizes arrive as decimal strings, occasionally as numbers.
fn parse_size(raw: Option<&Value>) -> Option<u64> {
    match raw? {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

/// Resolves items through `GET {metadata_base}/{item_id}`.
#[derive(Debug, Clone)]
pub struct ArchiveResolver {
    client: HttpClient,
    endpoints: ArchiveEndpoints,
}

impl ArchiveResolver {
    #[must_use]
    pub fn new(client: HttpClient, endpoints: ArchiveEndpoints) -> Self {
        Self { client, endpoints }
    }

    #[must_use]
    pub fn endpoints(&self) -> &ArchiveEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl ManifestResolver for ArchiveResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, item_id: &str) -> Result<Vec<RemoteFile>, ManifestError> {
        let url = self.endpoints.metadata_url(item_id);
        let response = self
            .client
            .get(&url)
            .await
            .map_err(|err| ManifestError::unavailable(item_id, err.to_string()))?;

        let body: MetadataResponse = response.json().await.map_err(|err| {
            ManifestError::unavailable(item_id, format!("unparseable metadata: {err}"))
        })?;

        // Unknown identifiers answer `{}` with a 200.
        let Some(entries) = body.files else {
            let cause = body
                .error
                .unwrap_or_else(|| "item has no file listing".to_string());
            return Err(ManifestError::unavailable(item_id, cause));
        };

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(name) = entry.name.filter(|name| !name.is_empty()) else {
                warn!(item_id, "skipping manifest entry without a name");
                continue;
            };
            let mut file = RemoteFile::new(item_id, name, parse_size(entry.size.as_ref()));
            file.format = entry.format;
            files.push(file);
        }

        debug!(item_id, files = files.len(), "manifest resolved");
        Ok(files)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn resolver_for(server: &MockServer) -> ArchiveResolver {
        ArchiveResolver::new(
            HttpClient::new(),
            ArchiveEndpoints::with_root(&server.uri()).unwrap(),
        )
    }

    #[test]
    fn test_parse_size_accepts_strings_and_numbers() {
        assert_eq!(parse_size(Some(&json!("1024"))), Some(1024));
        assert_eq!(parse_size(Some(&json!(2048))), Some(2048));
        assert_eq!(parse_size(Some(&json!("n/a"))), None);
        assert_eq!(parse_size(Some(&json!(-1))), None);
        assert_eq!(parse_size(None), None);
    }

    #[tokio::test]
    async fn test_resolve_preserves_server_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/item1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"identifier": "item1"},
                "files": [
                    {"name": "b.flac", "size": "20", "format": "Flac"},
                    {"name": "a.mp3", "size": "10"},
                    {"name": "item1_meta.xml"},
                    {"name": ""}
                ]
            })))
            .mount(&server)
            .await;

        let files = resolver_for(&server).await.resolve("item1").await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b.flac", "a.mp3", "item1_meta.xml"]);
        assert_eq!(files[0].size_bytes, Some(20));
        assert_eq!(files[0].format.as_deref(), Some("Flac"));
        assert_eq!(files[2].size_bytes, None);
    }

    #[tokio::test]
    async fn test_resolve_empty_object_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("ghost").await.unwrap_err();
        assert_eq!(err.item_id(), "ghost");
        assert!(err.cause().contains("no file listing"));
    }

    #[tokio::test]
    async fn test_resolve_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("item").await.unwrap_err();
        assert!(err.cause().contains("503"));
    }

    #[tokio::test]
    async fn test_resolve_garbage_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("item").await.unwrap_err();
        assert!(err.cause().contains("unparseable"));
    }

    #[tokio::test]
    async fn test_resolve_empty_listing_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": []})))
            .mount(&server)
            .await;

        let files = resolver_for(&server).await.resolve("empty").await.unwrap();
        assert!(files.is_empty());
    }
}
