//! Record sources: the data.gov.in fetch client and a fixture-backed source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mgnrega_core::RawRecord;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "mgnrega-adapters";

pub const DEFAULT_FETCH_LIMIT: u32 = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to upstream failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("configured endpoint is not a valid url: {0}")]
    Endpoint(String),
    #[error("upstream responded with http status {status}")]
    HttpStatus { status: u16 },
    #[error("upstream payload is not a records envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    // reqwest errors carry the request URL, which includes the api key.
    fn request(err: reqwest::Error) -> Self {
        Self::Request(err.without_url())
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn try_fetch_raw(&self) -> Result<Vec<RawRecord>, FetchError>;

    /// Never fails: an unavailable or malformed upstream yields no records.
    async fn fetch_raw(&self) -> Vec<RawRecord> {
        match self.try_fetch_raw().await {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    source_id = self.source_id(),
                    error = %err,
                    "upstream unavailable; continuing with no records"
                );
                Vec::new()
            }
        }
    }
}

/// `{ "records": [...], "total": n, ... }` as returned by the open-data API.
#[derive(Debug, Default, Deserialize)]
pub struct RecordsEnvelope {
    #[serde(default)]
    pub records: Option<JsonValue>,
    #[serde(default)]
    pub total: Option<JsonValue>,
}

impl RecordsEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Total rows the upstream claims to hold; it arrives as a number or a string.
    pub fn total_hint(&self) -> Option<u64> {
        match self.total.as_ref()? {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Object entries of `records`; a missing or non-array collection is no data.
    pub fn into_raw_records(self) -> Vec<RawRecord> {
        let Some(JsonValue::Array(items)) = self.records else {
            return Vec::new();
        };
        let total = items.len();
        let records: Vec<RawRecord> = items.into_iter().filter_map(RawRecord::from_value).collect();
        if records.len() < total {
            debug!(skipped = total - records.len(), "skipped non-object entries in records");
        }
        records
    }
}

#[derive(Debug, Clone)]
pub struct DataGovConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub offset: u32,
    pub limit: u32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl DataGovConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            offset: 0,
            limit: DEFAULT_FETCH_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }
}

/// One-page client for the data.gov.in resource API. No retries and no
/// pagination past the configured window.
#[derive(Debug)]
pub struct DataGovClient {
    client: reqwest::Client,
    config: DataGovConfig,
}

impl DataGovClient {
    pub fn new(config: DataGovConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DataGovConfig {
        &self.config
    }

    /// The configured endpoint plus the paging parameters. A parameter the
    /// endpoint already carries in its query string is left as configured.
    pub fn page_url(&self) -> Result<reqwest::Url, FetchError> {
        let mut url = reqwest::Url::parse(&self.config.endpoint)
            .map_err(|err| FetchError::Endpoint(err.to_string()))?;
        let present: Vec<String> = url.query_pairs().map(|(key, _)| key.into_owned()).collect();

        let offset = self.config.offset.to_string();
        let limit = self.config.limit.to_string();
        let mut params = vec![
            ("format", "json"),
            ("offset", offset.as_str()),
            ("limit", limit.as_str()),
        ];
        if let Some(api_key) = &self.config.api_key {
            params.push(("api-key", api_key.expose_secret()));
        }

        let missing: Vec<_> = params
            .into_iter()
            .filter(|(key, _)| !present.iter().any(|p| p.as_str() == *key))
            .collect();
        if !missing.is_empty() {
            url.query_pairs_mut().extend_pairs(missing);
        }
        Ok(url)
    }

    async fn fetch_page(&self) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.page_url()?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::request)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(FetchError::request)?;
        let envelope = RecordsEnvelope::parse(&body)?;
        let total = envelope.total_hint();
        let records = envelope.into_raw_records();

        if let Some(total) = total {
            let seen = u64::from(self.config.offset) + records.len() as u64;
            if total > seen {
                warn!(
                    total,
                    returned = records.len(),
                    "upstream holds more records than the fetched page; later pages are not fetched"
                );
            }
        }
        info!(returned = records.len(), "upstream page fetched");
        Ok(records)
    }
}

#[async_trait]
impl RecordSource for DataGovClient {
    fn source_id(&self) -> &str {
        "data.gov.in"
    }

    async fn try_fetch_raw(&self) -> Result<Vec<RawRecord>, FetchError> {
        let span = info_span!(
            "upstream_fetch",
            source_id = self.source_id(),
            offset = self.config.offset,
            limit = self.config.limit
        );
        self.fetch_page().instrument(span).await
    }
}

/// Serves a saved API response (or an inline record list) through the same
/// envelope handling as the live client.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    payload: FixturePayload,
}

#[derive(Debug, Clone)]
enum FixturePayload {
    File(PathBuf),
    Inline(Vec<RawRecord>),
}

impl FixtureSource {
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self {
            payload: FixturePayload::File(path.as_ref().to_path_buf()),
        }
    }

    pub fn inline(records: Vec<RawRecord>) -> Self {
        Self {
            payload: FixturePayload::Inline(records),
        }
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn try_fetch_raw(&self) -> Result<Vec<RawRecord>, FetchError> {
        match &self.payload {
            FixturePayload::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|source| FetchError::Fixture {
                    path: path.clone(),
                    source,
                })?;
                Ok(RecordsEnvelope::parse(&bytes)?.into_raw_records())
            }
            FixturePayload::Inline(records) => Ok(records.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{delay_and_then, json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn client_for(server: &Server) -> DataGovClient {
        let config = DataGovConfig {
            offset: 0,
            limit: 50,
            timeout: Duration::from_secs(5),
            ..DataGovConfig::new(server.url_str("/resource/mgnrega"))
        }
        .with_api_key("test-secret-key");
        DataGovClient::new(config).expect("client")
    }

    #[tokio::test]
    async fn fetches_first_page_with_key_and_window() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/resource/mgnrega"),
                request::query(url_decoded(contains(("api-key", "test-secret-key")))),
                request::query(url_decoded(contains(("format", "json")))),
                request::query(url_decoded(contains(("offset", "0")))),
                request::query(url_decoded(contains(("limit", "50"))))
            ])
            .respond_with(json_encoded(json!({
                "total": 3,
                "count": 2,
                "records": [
                    {"fin_year": "2024-2025", "district_code": "1801"},
                    "not-a-record",
                    {"fin_year": "2024-2025", "district_code": "1802"}
                ]
            }))),
        );

        let records = client_for(&server).try_fetch_raw().await.expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("district_code"), Some(&json!("1802")));
    }

    #[tokio::test]
    async fn server_error_degrades_to_empty() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/resource/mgnrega"))
                .times(2)
                .respond_with(status_code(503)),
        );

        let client = client_for(&server);
        let err = client.try_fetch_raw().await.expect_err("503");
        assert!(matches!(err, FetchError::HttpStatus { status: 503 }));
        assert!(!err.to_string().contains("test-secret-key"));
        assert!(client.fetch_raw().await.is_empty());
    }

    #[tokio::test]
    async fn missing_records_is_no_data() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/resource/mgnrega"))
                .respond_with(json_encoded(json!({"message": "Resource id doesn't exist."}))),
        );
        let records = client_for(&server).try_fetch_raw().await.expect("fetch");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/resource/mgnrega"))
                .times(2)
                .respond_with(status_code(200).body("<html>maintenance</html>")),
        );
        let client = client_for(&server);
        assert!(matches!(
            client.try_fetch_raw().await,
            Err(FetchError::Decode(_))
        ));
        assert!(client.fetch_raw().await.is_empty());
    }

    #[tokio::test]
    async fn slow_upstream_hits_the_timeout() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/resource/mgnrega")).respond_with(
                delay_and_then(Duration::from_secs(2), status_code(200).body("{}")),
            ),
        );
        let config = DataGovConfig {
            timeout: Duration::from_millis(200),
            ..DataGovConfig::new(server.url_str("/resource/mgnrega"))
        }
        .with_api_key("test-secret-key");
        let client = DataGovClient::new(config).expect("client");

        let err = client.try_fetch_raw().await.expect_err("timeout");
        assert!(matches!(err, FetchError::Request(_)));
        assert!(!err.to_string().contains("test-secret-key"));
    }

    #[test]
    fn envelope_total_accepts_numbers_and_strings() {
        let numeric = RecordsEnvelope::parse(br#"{"total": 12}"#).expect("parse");
        assert_eq!(numeric.total_hint(), Some(12));
        let text = RecordsEnvelope::parse(br#"{"total": "740", "records": null}"#).expect("parse");
        assert_eq!(text.total_hint(), Some(740));
        assert!(text.into_raw_records().is_empty());
    }

    #[test]
    fn endpoint_query_parameters_are_not_repeated() {
        let config = DataGovConfig {
            offset: 40,
            limit: 250,
            ..DataGovConfig::new("https://api.example/resource/abc?format=json&limit=10")
        }
        .with_api_key("k-1");
        let url = DataGovClient::new(config).expect("client").page_url().expect("url");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let count = |key: &str| pairs.iter().filter(|(k, _)| k == key).count();
        assert_eq!(count("format"), 1);
        assert_eq!(count("limit"), 1);
        assert!(pairs.contains(&("limit".to_string(), "10".to_string())));
        assert!(pairs.contains(&("offset".to_string(), "40".to_string())));
        assert!(pairs.contains(&("api-key".to_string(), "k-1".to_string())));
    }

    #[test]
    fn unparsable_endpoint_is_reported() {
        let client = DataGovClient::new(DataGovConfig::new("not a url")).expect("client");
        assert!(matches!(client.page_url(), Err(FetchError::Endpoint(_))));
    }

    #[tokio::test]
    async fn fixture_file_and_inline_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("response.json");
        std::fs::write(&path, r#"{"records": [{"fin_year": "2023-2024"}]}"#).expect("write");

        let from_file = FixtureSource::from_file(&path).try_fetch_raw().await.expect("file");
        assert_eq!(from_file.len(), 1);

        let inline = FixtureSource::inline(vec![RawRecord::new().with("month", "Feb")]);
        assert_eq!(inline.fetch_raw().await.len(), 1);

        let missing = FixtureSource::from_file(dir.path().join("absent.json"));
        assert!(matches!(
            missing.try_fetch_raw().await,
            Err(FetchError::Fixture { .. })
        ));
        assert!(missing.fetch_raw().await.is_empty());
    }
}
