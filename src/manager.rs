//! Top-level wiring: constructs every subcomponent from `AppConfig` and
//! exposes the operations the CLI surface and the interactive control plane
//! both drive into. One entry point per CLI command, each just threading
//! the already-built components together rather than owning their logic.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::manager::BridgeManager;
use crate::cache::CacheStore;
use crate::chains;
use crate::control::CommandProcessor;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::AppConfig;
use crate::core::coordinator::{Coordinator, ManagerState};
use crate::core::error::{NyxProxyError, ProxyChainsError};
use crate::core::event::{EventReceiver, EventSender, create_event_channel};
use crate::core::model::{Outbound, SourceKind, Sources, TestResult};
use crate::engine::launcher::Launcher;
use crate::engine::port_allocator::OsPortAllocator;
use crate::engine::spawner::TokioSpawner;
use crate::geo::GeoLookup;
use crate::health::{HealthCheckConfig, HealthChecker};
use crate::source::SourceLoader;

/// Options shared by `test`/`start`/`chains`; mirrors the CLI flags that
/// feed into a health-check pass.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub country: Option<String>,
    pub limit: usize,
    pub force: bool,
    pub find_first: Option<usize>,
    pub extra_sources: Vec<String>,
    pub skip_geo: bool,
}

pub struct NyxProxyManager {
    config: AppConfig,
    coordinator: Arc<Coordinator>,
    cache: Arc<CacheStore>,
    geo: Arc<GeoLookup>,
    checker: Arc<HealthChecker>,
    bridges: Arc<BridgeManager>,
    sources: Arc<Mutex<Sources>>,
    source_loader: Arc<SourceLoader>,
    events: EventSender,
    clock: Arc<dyn Clock>,
}

impl NyxProxyManager {
    /// Wires every component from config. Returns the manager plus the
    /// receiving half of the event bus, which the caller (CLI or REPL)
    /// drains for status output.
    pub fn new(config: AppConfig) -> (Self, EventReceiver) {
        let (events, events_rx) = create_event_channel();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let cache = Arc::new(CacheStore::new(config.cache_path(), clock.clone()));
        cache.load();

        let geo = Arc::new(GeoLookup::new(
            config.geo_cache_path(),
            config.findip_token.clone(),
            clock.clone(),
        ));
        geo.load_cache();

        let engine_bin = config
            .engine_bin
            .clone()
            .or_else(|| std::env::var("XRAY_PATH").ok())
            .unwrap_or_else(|| "xray".to_string());
        let launcher = Arc::new(Launcher::new(engine_bin, OsPortAllocator::new(), Arc::new(TokioSpawner)));

        let checker = Arc::new(HealthChecker::new(
            launcher.clone(),
            cache.clone(),
            geo.clone(),
            events.clone(),
            clock.clone(),
        ));

        let coordinator = Arc::new(Coordinator::new());
        let sources = Arc::new(Mutex::new(Sources::new()));
        let source_loader = Arc::new(SourceLoader::new(sources.clone(), events.clone()));

        let bridges = Arc::new(BridgeManager::new(
            launcher,
            checker.clone(),
            coordinator.clone(),
            source_loader.clone(),
            events.clone(),
            clock.clone(),
            config.chains_path(),
        ));

        let manager = Self {
            config,
            coordinator,
            cache,
            geo,
            checker,
            bridges,
            sources,
            source_loader,
            events,
            clock,
        };
        (manager, events_rx)
    }

    pub fn events_handle(&self) -> EventSender {
        self.events.clone()
    }

    pub fn command_processor(&self) -> CommandProcessor {
        CommandProcessor::new(self.bridges.clone(), self.sources.clone())
    }

    pub fn register_source(&self, kind: SourceKind) -> usize {
        self.sources.lock().add(kind)
    }

    /// Loads from every registered source plus any one-off `--source` flags,
    /// applying the optional result-count limit (`0` means unlimited).
    async fn load_candidates(&self, opts: &RunOptions) -> Vec<Outbound> {
        let mut outbounds = self.source_loader.load_all().await;
        for extra in &opts.extra_sources {
            let kind = if extra.starts_with("http://") || extra.starts_with("https://") {
                SourceKind::Http(extra.clone())
            } else {
                SourceKind::File(extra.into())
            };
            outbounds.extend(self.source_loader.load_one(&kind).await);
        }
        if opts.limit > 0 && outbounds.len() > opts.limit {
            outbounds.truncate(opts.limit);
        }
        outbounds
    }

    /// `test`: loads, health-checks, and caches, without starting bridges.
    pub async fn test(&self, opts: RunOptions) -> Vec<TestResult> {
        self.coordinator.set_state(ManagerState::Loading);
        let outbounds = self.load_candidates(&opts).await;

        self.coordinator.set_state(ManagerState::Testing);
        let cfg = HealthCheckConfig {
            test_url: self.config.test_url.clone(),
            phase1_timeout: std::time::Duration::from_secs_f64(self.config.phase1_timeout_secs),
            phase2_timeout: std::time::Duration::from_secs_f64(self.config.phase2_timeout_secs),
            phase2_concurrency: self.config.phase2_concurrency,
            country_filter: opts.country.clone(),
            force: opts.force,
            find_first: opts.find_first,
            skip_geo: opts.skip_geo,
        };
        let results = self.checker.test_batch(&outbounds, &cfg).await;
        self.bridges.record(&outbounds, &results);
        self.coordinator.set_state(ManagerState::Idle);
        results
    }

    /// `start`: tests, then launches bridges for the first `amounts` OK
    /// results, by ascending ping. Fails with `InsufficientProxies` if no
    /// candidate passed health-checking at all (e.g. an empty source list).
    pub async fn start(&self, amounts: usize, opts: RunOptions) -> Result<usize, NyxProxyError> {
        let find_first = opts.find_first.or(Some(amounts));
        let opts = RunOptions { find_first, ..opts };
        let results = self.test(opts.clone()).await;

        let mut ok: Vec<&TestResult> = results
            .iter()
            .filter(|r| r.status == crate::core::model::Status::Ok)
            .collect();
        ok.sort_by(|a, b| {
            a.ping_ms
                .unwrap_or(f64::INFINITY)
                .total_cmp(&b.ping_ms.unwrap_or(f64::INFINITY))
        });

        if ok.is_empty() {
            return Err(NyxProxyError::InsufficientProxies {
                needed: amounts,
                available: 0,
            });
        }

        let outbounds = self.load_candidates(&opts).await;
        let by_uri: std::collections::HashMap<&str, &Outbound> =
            outbounds.iter().map(|o| (o.uri.as_str(), o)).collect();
        let chosen: Vec<Outbound> = ok
            .into_iter()
            .take(amounts)
            .filter_map(|r| by_uri.get(r.uri.as_str()).map(|o| (*o).clone()))
            .collect();

        self.bridges.set_country_filter(opts.country);
        self.coordinator.set_state(ManagerState::Running);
        let live = self.bridges.start(chosen).await;
        if live == 0 {
            return Err(NyxProxyError::InsufficientProxies {
                needed: amounts,
                available: 0,
            });
        }
        Ok(live)
    }

    pub async fn stop(&self) {
        self.coordinator.begin_stop();
        self.bridges.stop_all().await;
        self.coordinator.finish_stop();
    }

    /// `chains`: always launches a fresh bridge batch and tears it down on
    /// exit, rather than reusing any bridges already running.
    pub async fn run_chains(&self, amounts: usize, opts: RunOptions, cmd: Vec<String>) -> Result<i32, ProxyChainsError> {
        let live = self.start(amounts, opts).await;
        let live = match live {
            Ok(live) => live,
            Err(err) => {
                self.stop().await;
                return Err(ProxyChainsError::Exec(format!("no proxy bridges could be started for the chain: {err}")));
            }
        };
        debug_assert!(live > 0);
        let ports: Vec<u16> = self.bridges.snapshot().await.into_iter().map(|b| b.port).collect();
        let result = chains::run_with_chains(&ports, &cmd).await;
        self.stop().await;
        result
    }

    /// `clear`: prunes cache entries older than `age` (`None` clears all).
    pub fn clear_cache(&self, age: Option<f64>) -> usize {
        let pruned = self.cache.prune(age);
        if let Err(err) = self.cache.save() {
            self.events.warn(format!("cache save failed after clear: {err}"));
        }
        pruned
    }

    pub async fn list_proxies(&self) -> Vec<crate::bridge::manager::BridgeInfo> {
        self.bridges.snapshot().await
    }

    pub fn save_geo_cache(&self) {
        if let Err(err) = self.geo.save_cache() {
            self.events.warn(format!("geo cache save failed: {err}"));
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Boundary: an empty source list tests to nothing and start() refuses
    // to claim success.
    #[tokio::test]
    async fn start_with_no_sources_returns_insufficient_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.config_dir = Some(dir.path().to_string_lossy().into_owned());
        let (manager, _events_rx) = NyxProxyManager::new(config);

        let results = manager.test(RunOptions::default()).await;
        assert!(results.is_empty());

        let err = manager.start(3, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, NyxProxyError::InsufficientProxies { needed: 3, available: 0 }));
    }
}
