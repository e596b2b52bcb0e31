//! HTTP retrieval of dataset CSV extracts

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::DatasetSpec;

const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const USER_AGENT: &str = concat!("govsense/", env!("CARGO_PKG_VERSION"));

/// One row as fetched, untyped header/value pairs in source order.
/// Ephemeral: produced here, consumed by the cleaner, never persisted.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub fields: Vec<(String, String)>,
}

/// Retrieval seam between the orchestrator and the network.
/// One-shot per call; re-invoke to re-fetch.
#[async_trait]
pub trait Ingest: Send + Sync {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<Vec<RawRecord>>;
}

/// data.gouv.fr client: resolves a dataset slug to its first CSV resource
/// and downloads it, with bounded retry on transient failures
pub struct Fetcher {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl Fetcher {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Result<Fetcher> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?;
        Ok(Fetcher {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
        })
    }

    /// GET with exponential backoff on connect errors, per-attempt
    /// timeouts and HTTP 429/5xx; anything else fails immediately
    async fn get_with_retry(&self, url: &str, dataset: &str) -> Result<String> {
        let mut backoff = RETRY_BACKOFF;
        let mut last_failure = String::new();
        for attempt in 0..=self.max_retries {
            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) => return Ok(body),
                            Err(e) => last_failure = format!("reading body: {e}"),
                        }
                    } else if status.as_u16() == 429 || status.is_server_error() {
                        last_failure = format!("HTTP {status}");
                    } else {
                        return Err(Error::SourceUnavailable(format!(
                            "{dataset}: HTTP {status} from {url}"
                        )));
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_failure = e.to_string();
                }
                Err(e) => {
                    return Err(Error::SourceUnavailable(format!("{dataset}: {e}")));
                }
            }
            if attempt < self.max_retries {
                warn!(
                    dataset,
                    attempt = attempt + 1,
                    backoff_secs = backoff.as_secs(),
                    failure = %last_failure,
                    "transient fetch failure, retrying"
                );
                sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(Error::SourceUnavailable(format!(
            "{dataset}: giving up after {} attempts: {last_failure}",
            self.max_retries + 1
        )))
    }

    /// Resolve the CSV url: settings override, or dataset metadata lookup
    async fn resolve_csv_url(&self, spec: &DatasetSpec) -> Result<String> {
        if let Some(url) = &spec.url {
            return Ok(url.clone());
        }
        let meta_url = format!("{}/datasets/{}/", self.base_url, spec.slug);
        let body = self.get_with_retry(&meta_url, spec.id).await?;
        let meta: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| Error::SourceUnavailable(format!("{}: dataset metadata: {e}", spec.id)))?;
        meta.get("resources")
            .and_then(|r| r.as_array())
            .into_iter()
            .flatten()
            .find(|r| {
                r.get("format")
                    .and_then(|f| f.as_str())
                    .is_some_and(|f| f.eq_ignore_ascii_case("csv"))
            })
            .and_then(|r| r.get("url"))
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::SourceUnavailable(format!("{}: no CSV resource in dataset metadata", spec.id))
            })
    }
}

#[async_trait]
impl Ingest for Fetcher {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<Vec<RawRecord>> {
        let url = self.resolve_csv_url(spec).await?;
        info!(dataset = spec.id, %url, "downloading CSV");
        let body = self.get_with_retry(&url, spec.id).await?;
        let rows = decode_csv(&body, spec.delimiter)?;
        info!(dataset = spec.id, rows = rows.len(), "downloaded");
        Ok(rows)
    }
}

/// Parse a CSV payload into raw records. A payload without a header row
/// is a schema mismatch; individually malformed lines are skipped.
pub fn decode_csv(payload: &str, delimiter: u8) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(payload.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| Error::SchemaMismatch(format!("unreadable header row: {e}")))?
        .clone();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(Error::SchemaMismatch("payload has no header row".into()));
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        match record {
            Ok(r) => rows.push(RawRecord {
                fields: headers
                    .iter()
                    .zip(r.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect(),
            }),
            Err(e) => warn!("skipping malformed CSV line: {e}"),
        }
    }
    Ok(rows)
}
