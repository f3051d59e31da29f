//! Source Loader (J): reads URIs from files and HTTP endpoints, unwraps the
//! subscription-blob base64 encoding some providers use, drops noise-tagged
//! entries, and deduplicates by URI before handing outbounds onward.
//!
//! The retry-wrapped HTTP client mirrors the Geo Lookup's (itself grounded
//! on `HttpService`); fetching a subscription URL is the same kind of
//! best-effort external call.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use tracing::warn;

use crate::bridge::manager::OutboundProvider;
use crate::core::event::EventSender;
use crate::core::model::{Outbound, SourceKind, Sources};
use crate::parser;

pub struct SourceLoader {
    client: ClientWithMiddleware,
    sources: Arc<Mutex<Sources>>,
    events: EventSender,
}

impl SourceLoader {
    pub fn new(sources: Arc<Mutex<Sources>>, events: EventSender) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self { client, sources, events }
    }

    /// Fetches every registered source, parses, drops noise tags, and
    /// deduplicates by `uri` (the outbound's process-wide primary key),
    /// keeping the first occurrence.
    pub async fn load_all(&self) -> Vec<Outbound> {
        let kinds: Vec<SourceKind> = self.sources.lock().iter().map(|(_, k)| k.clone()).collect();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for kind in &kinds {
            let Some(raw) = self.fetch(kind).await else { continue };
            for outbound in self.parse_blob(&raw) {
                if seen.insert(outbound.uri.clone()) {
                    out.push(outbound);
                }
            }
        }
        out
    }

    /// Loads a single ad-hoc source (a CLI `--source` flag) without
    /// registering it, deduplicating only within its own blob.
    pub async fn load_one(&self, kind: &SourceKind) -> Vec<Outbound> {
        let Some(raw) = self.fetch(kind).await else { return Vec::new() };
        let mut seen = HashSet::new();
        self.parse_blob(&raw)
            .into_iter()
            .filter(|o| seen.insert(o.uri.clone()))
            .collect()
    }

    fn parse_blob(&self, raw: &str) -> Vec<Outbound> {
        let text = if looks_like_uri_list(raw) {
            raw.to_string()
        } else {
            parser::decode_base64_flexible(raw).unwrap_or_else(|_| raw.to_string())
        };

        parser::parse_batch(&text)
            .into_iter()
            .filter_map(|result| match result {
                Ok(outbound) if parser::is_noise_tag(&outbound.tag) => None,
                Ok(outbound) => Some(outbound),
                Err(err) => {
                    self.events.warn(format!("source parse error: {err}"));
                    None
                }
            })
            .collect()
    }

    async fn fetch(&self, kind: &SourceKind) -> Option<String> {
        match kind {
            SourceKind::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!("failed to read source file {}: {err}", path.display());
                    None
                }
            },
            SourceKind::Http(url) => match self.client.get(url).send().await {
                Ok(resp) => match resp.text().await {
                    Ok(text) => Some(text),
                    Err(err) => {
                        warn!("failed to read response body from {url}: {err}");
                        None
                    }
                },
                Err(err) => {
                    warn!("failed to fetch source {url}: {err}");
                    None
                }
            },
        }
    }
}

/// A blob is treated as a plain URI list (rather than a base64-encoded
/// subscription payload) if any of its first few lines already contains a
/// `scheme://` separator.
fn looks_like_uri_list(raw: &str) -> bool {
    raw.lines()
        .take(5)
        .any(|line| !line.trim().is_empty() && line.contains("://"))
}

#[async_trait]
impl OutboundProvider for SourceLoader {
    async fn reload(&self) -> Vec<Outbound> {
        self.load_all().await
    }
}
