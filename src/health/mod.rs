//! Health Checker (E): two-phase probe. Phase 1 is a cheap TCP screen;
//! Phase 2 launches a temporary bridge per survivor and drives real HTTP
//! traffic through it. Grounded on the cache short-circuit and geo
//! enrichment rules described for this component, with the actual proxy
//! traffic shaped after `HttpService` (an explicit
//! per-request proxy client, never process-wide env vars).

pub mod classify;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::CacheStore;
use crate::core::clock::Clock;
use crate::core::event::{EventSender, StatusEvent};
use crate::core::model::{CacheEntry, Outbound, Status, TestResult};
use crate::engine::launcher::Launcher;
use crate::geo::GeoLookup;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub test_url: String,
    pub phase1_timeout: Duration,
    pub phase2_timeout: Duration,
    pub phase2_concurrency: usize,
    pub country_filter: Option<String>,
    pub force: bool,
    pub find_first: Option<usize>,
    pub skip_geo: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            test_url: "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
            phase1_timeout: Duration::from_secs_f64(1.0),
            phase2_timeout: Duration::from_secs_f64(3.0),
            phase2_concurrency: 20,
            country_filter: None,
            force: false,
            find_first: None,
            skip_geo: false,
        }
    }
}

const PHASE1_CONCURRENCY: usize = 100;

pub struct HealthChecker {
    launcher: Arc<Launcher>,
    cache: Arc<CacheStore>,
    geo: Arc<GeoLookup>,
    events: EventSender,
    clock: Arc<dyn Clock>,
    exit_ip_re: Regex,
}

impl HealthChecker {
    pub fn new(
        launcher: Arc<Launcher>,
        cache: Arc<CacheStore>,
        geo: Arc<GeoLookup>,
        events: EventSender,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            launcher,
            cache,
            geo,
            events,
            clock,
            exit_ip_re: Regex::new(r"ip=([0-9.]+)").expect("valid regex"),
        }
    }

    pub async fn test_batch(
        &self,
        outbounds: &[Outbound],
        cfg: &HealthCheckConfig,
    ) -> Vec<TestResult> {
        let mut results: HashMap<String, TestResult> = HashMap::new();
        let mut to_screen = Vec::new();
        let mut cache_ok_count = 0usize;

        for outbound in outbounds {
            if !cfg.force {
                if let Some(cached) = self.cache.lookup(&outbound.uri) {
                    let result = cached.to_result();
                    if result.status == Status::Ok
                        && self.passes_country_filter(&result, &cfg.country_filter)
                    {
                        self.events.emit(StatusEvent::ProbeResult {
                            uri: outbound.uri.clone(),
                            status: Status::Ok,
                            cached: true,
                        });
                        results.insert(outbound.uri.clone(), result);
                        cache_ok_count += 1;
                        continue;
                    }
                }
            }
            to_screen.push(outbound.clone());
        }

        let survivors = self.phase1_screen(to_screen, cfg, &mut results).await;
        self.phase2_probe(survivors, cfg, &mut results, cache_ok_count).await;

        if let Err(err) = self.cache.save() {
            warn!("cache save failed after test batch: {err}");
        }
        if !cfg.skip_geo {
            if let Err(err) = self.geo.save_cache() {
                warn!("geo cache save failed: {err}");
            }
        }

        results.into_values().collect()
    }

    async fn phase1_screen(
        &self,
        candidates: Vec<Outbound>,
        cfg: &HealthCheckConfig,
        results: &mut HashMap<String, TestResult>,
    ) -> Vec<Outbound> {
        let sem = Arc::new(Semaphore::new(PHASE1_CONCURRENCY));
        let timeout = cfg.phase1_timeout;

        let screened = stream::iter(candidates.into_iter().map(|outbound| {
            let sem = sem.clone();
            async move {
                let _permit = sem.acquire().await;
                let reachable = tokio::time::timeout(
                    timeout,
                    TcpStream::connect((outbound.host.as_str(), outbound.port)),
                )
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
                (outbound, reachable)
            }
        }))
        .buffer_unordered(PHASE1_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        let mut survivors = Vec::new();
        for (outbound, reachable) in screened {
            self.events.emit(StatusEvent::Phase1Result {
                uri: outbound.uri.clone(),
                reachable,
            });
            if reachable {
                survivors.push(outbound);
            } else {
                let mut result = TestResult::pending(&outbound.uri);
                result.status = Status::Error;
                result.error = Some("Connection refused (Phase 1)".to_string());
                result.tested_at = Some(self.clock.now());
                results.insert(outbound.uri.clone(), result);
            }
        }
        survivors
    }

    async fn phase2_probe(
        &self,
        survivors: Vec<Outbound>,
        cfg: &HealthCheckConfig,
        results: &mut HashMap<String, TestResult>,
        cache_ok_count: usize,
    ) {
        let find_first = cfg.find_first;
        if let Some(target) = find_first {
            if cache_ok_count >= target {
                return;
            }
        }

        let sem = Arc::new(Semaphore::new(cfg.phase2_concurrency.max(1)));
        let cancel = CancellationToken::new();
        let ok_count = Arc::new(AtomicUsize::new(cache_ok_count));

        let probed = stream::iter(survivors.into_iter().enumerate().map(|(idx, outbound)| {
            let sem = sem.clone();
            let cancel = cancel.clone();
            let ok_count = ok_count.clone();
            async move {
                let _permit = sem.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let result = self.probe_one(idx, &outbound, cfg, &cancel).await;
                if result.status == Status::Ok {
                    let reached = ok_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(target) = find_first {
                        if reached >= target {
                            cancel.cancel();
                        }
                    }
                }
                Some((outbound.uri.clone(), result))
            }
        }))
        .buffer_unordered(cfg.phase2_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        for (uri, result) in probed.into_iter().flatten() {
            self.events.emit(StatusEvent::ProbeResult {
                uri: uri.clone(),
                status: result.status,
                cached: false,
            });
            if let Some(entry) = CacheEntry::from_result(&result) {
                self.cache.merge(entry);
            }
            results.insert(uri, result);
        }
    }

    async fn probe_one(
        &self,
        id: usize,
        outbound: &Outbound,
        cfg: &HealthCheckConfig,
        cancel: &CancellationToken,
    ) -> TestResult {
        let mut result = TestResult::pending(&outbound.uri);

        let live = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                result.status = Status::Error;
                result.error = Some("cancelled before launch".to_string());
                result.tested_at = Some(self.clock.now());
                return result;
            }
            live = self.launcher.launch(id, &outbound.uri, &outbound.tag, &outbound.engine_config) => live,
        };

        let live = match live {
            Ok(live) => live,
            Err(err) => {
                result.status = Status::Error;
                result.error = Some(err.to_string());
                result.tested_at = Some(self.clock.now());
                return result;
            }
        };

        let proxy_url = format!("http://127.0.0.1:{}", live.bridge.local_port);
        let probe_outcome = self.run_probe(&proxy_url, cfg).await;
        self.launcher.teardown(live).await;

        result.tested_at = Some(self.clock.now());
        match probe_outcome {
            Ok((ping_ms, exit_ip)) => {
                result.status = Status::Ok;
                result.ping_ms = Some(ping_ms);
                if let Some(ip) = exit_ip {
                    let geo = if cfg.skip_geo {
                        crate::core::model::Geo::new(ip)
                    } else {
                        self.geo.resolve(&ip).await
                    };
                    result.exit_geo = Some(geo);
                }
                // Resolve/filter before this returns to the caller, so a
                // non-matching geo never counts toward the find_first budget.
                if !self.passes_country_filter(&result, &cfg.country_filter) {
                    result.status = Status::Filtered;
                    if let Some(filter) = &cfg.country_filter {
                        result.error = Some(format!("country filter: does not match {filter}"));
                    }
                }
            }
            Err(reason) => {
                result.status = Status::Error;
                result.error = Some(reason);
            }
        }
        result
    }

    async fn run_probe(
        &self,
        proxy_url: &str,
        cfg: &HealthCheckConfig,
    ) -> Result<(f64, Option<String>), String> {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| e.to_string())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(cfg.phase2_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| e.to_string())?;

        let start = std::time::Instant::now();
        let resp = client
            .get(&cfg.test_url)
            .send()
            .await
            .map_err(|e| classify::classify_reqwest_error(&e).1)?;

        if !resp.status().is_success() {
            return Err(format!("HTTP status {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| e.to_string())?;
        let ping_ms = start.elapsed().as_secs_f64() * 1000.0;
        let exit_ip = self
            .exit_ip_re
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        Ok((ping_ms, exit_ip))
    }

    fn passes_country_filter(&self, result: &TestResult, filter: &Option<String>) -> bool {
        match filter {
            None => true,
            Some(wanted) => result
                .effective_geo()
                .map(|g| g.label() == wanted)
                .unwrap_or(false),
        }
    }
}
