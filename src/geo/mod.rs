//! Geo Lookup (F): resolves an IP to a country, cached on disk, backed by a
//! primary provider (FindIP.net, token-gated) with a secondary fallback.
//! A lookup failure never surfaces as an error — it degrades to `Unknown`.
//!
//! The retry-wrapped client mirrors `HttpService` (a plain
//! `reqwest::Client` wrapped in `reqwest_middleware` with
//! `RetryTransientMiddleware`), minus the proxy hop since geo queries run
//! direct.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::core::clock::Clock;
use crate::core::model::Geo;

const GEO_CONCURRENCY: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeoCacheEntry {
    country_code: Option<String>,
    country_name: Option<String>,
    fetched_at: f64,
}

pub struct GeoLookup {
    client: ClientWithMiddleware,
    findip_token: Option<String>,
    cache_path: PathBuf,
    cache: Mutex<HashMap<String, GeoCacheEntry>>,
    semaphore: Semaphore,
    clock: Arc<dyn Clock>,
}

impl GeoLookup {
    pub fn new(cache_path: impl Into<PathBuf>, findip_token: Option<String>, clock: Arc<dyn Clock>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            findip_token,
            cache_path: cache_path.into(),
            cache: Mutex::new(HashMap::new()),
            semaphore: Semaphore::new(GEO_CONCURRENCY),
            clock,
        }
    }

    pub fn load_cache(&self) {
        let map = std::fs::read_to_string(&self.cache_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        *self.cache.lock() = map;
    }

    pub fn save_cache(&self) -> std::io::Result<()> {
        let cache = self.cache.lock();
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*cache)?;
        std::fs::write(&self.cache_path, json)
    }

    /// Resolves a single IP; a cache hit short-circuits both providers.
    pub async fn resolve(&self, ip: &str) -> Geo {
        if let Some(entry) = self.cache.lock().get(ip).cloned() {
            return Geo {
                ip: ip.to_string(),
                country_code: entry.country_code,
                country_name: entry.country_name,
            };
        }

        let _permit = self.semaphore.acquire().await;
        let resolved = match self.query_findip(ip).await {
            Some(geo) => Some(geo),
            None => self.query_secondary(ip).await,
        };

        let (country_code, country_name) = match &resolved {
            Some(geo) => (geo.country_code.clone(), geo.country_name.clone()),
            None => (None, None),
        };

        self.cache.lock().insert(
            ip.to_string(),
            GeoCacheEntry {
                country_code: country_code.clone(),
                country_name: country_name.clone(),
                fetched_at: self.clock.now(),
            },
        );

        Geo {
            ip: ip.to_string(),
            country_code,
            country_name,
        }
    }

    /// Resolves many IPs concurrently, bounded by `GEO_CONCURRENCY`.
    pub async fn resolve_many(&self, ips: Vec<String>) -> HashMap<String, Geo> {
        stream::iter(ips)
            .map(|ip| async move { (ip.clone(), self.resolve(&ip).await) })
            .buffer_unordered(GEO_CONCURRENCY)
            .collect()
            .await
    }

    async fn query_findip(&self, ip: &str) -> Option<Geo> {
        let token = self.findip_token.as_ref()?;
        let url = format!("https://api.findip.net/{ip}/?token={token}");
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        let country_code = body["country"]["iso_code"].as_str().map(str::to_string);
        let country_name = body["country"]["names"]["en"].as_str().map(str::to_string);
        if country_code.is_none() && country_name.is_none() {
            return None;
        }
        Some(Geo {
            ip: ip.to_string(),
            country_code,
            country_name,
        })
    }

    async fn query_secondary(&self, ip: &str) -> Option<Geo> {
        let url = format!("http://ip-api.com/json/{ip}?fields=status,countryCode,country");
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        if body["status"].as_str() != Some("success") {
            debug!("secondary geo lookup failed for {ip}");
            return None;
        }
        Some(Geo {
            ip: ip.to_string(),
            country_code: body["countryCode"].as_str().map(str::to_string),
            country_name: body["country"].as_str().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FakeClock;
    use tempfile::tempdir;

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geo_cache.json");
        let lookup = GeoLookup::new(&path, None, Arc::new(FakeClock::new(1000.0)));
        lookup.cache.lock().insert(
            "1.2.3.4".to_string(),
            GeoCacheEntry {
                country_code: Some("US".to_string()),
                country_name: Some("United States".to_string()),
                fetched_at: 1000.0,
            },
        );
        lookup.save_cache().unwrap();

        let reloaded = GeoLookup::new(&path, None, Arc::new(FakeClock::new(1000.0)));
        reloaded.load_cache();
        assert_eq!(reloaded.cache.lock().get("1.2.3.4").unwrap().country_code, Some("US".to_string()));
    }

    #[tokio::test]
    async fn resolve_uses_cache_without_any_network_call() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geo_cache.json");
        let lookup = GeoLookup::new(&path, None, Arc::new(FakeClock::new(1000.0)));
        lookup.cache.lock().insert(
            "5.6.7.8".to_string(),
            GeoCacheEntry {
                country_code: Some("FR".to_string()),
                country_name: Some("France".to_string()),
                fetched_at: 1000.0,
            },
        );
        let geo = lookup.resolve("5.6.7.8").await;
        assert_eq!(geo.country_code, Some("FR".to_string()));
    }

    #[test]
    fn load_cache_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let lookup = GeoLookup::new(&path, None, Arc::new(FakeClock::new(1000.0)));
        lookup.load_cache();
        assert!(lookup.cache.lock().is_empty());
    }
}
