//! Bridge Manager (G): the live bridge vector, rotation with a recency
//! queue, and elastic resize. Grounded on `bridge_manager.py`'s
//! `rotate_proxy`/`adjust_bridge_amount`, reworked around the injected
//! `Launcher` (D) and the rotation mutex already owned by `Coordinator`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::core::clock::Clock;
use crate::core::coordinator::Coordinator;
use crate::core::event::{EventSender, StatusEvent};
use crate::core::model::{BridgeStatus, Outbound, Status, TestResult, UsedQueue};
use crate::engine::launcher::{LiveBridge, Launcher};
use crate::health::{HealthCheckConfig, HealthChecker};

/// Bound on concurrent teardowns in `stop_all`.
const STOP_ALL_CONCURRENCY: usize = 16;

/// Supplies fresh outbounds when rotation/resize runs dry. Decouples this
/// module from the Source Loader the way `PortAllocator`/`ProcessSpawner`
/// decouple the Engine Launcher from the OS.
#[async_trait]
pub trait OutboundProvider: Send + Sync {
    async fn reload(&self) -> Vec<Outbound>;
}

/// An `OutboundProvider` that never finds anything new; used where no
/// sources were configured.
pub struct NoSources;

#[async_trait]
impl OutboundProvider for NoSources {
    async fn reload(&self) -> Vec<Outbound> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub id: usize,
    pub uri: String,
    pub tag: String,
    pub port: u16,
    pub status: BridgeStatus,
}

pub struct BridgeManager {
    launcher: Arc<Launcher>,
    checker: Arc<HealthChecker>,
    coordinator: Arc<Coordinator>,
    source: Arc<dyn OutboundProvider>,
    events: EventSender,
    clock: Arc<dyn Clock>,
    order_path: PathBuf,

    bridges: AsyncMutex<Vec<LiveBridge>>,
    used_queue: Mutex<UsedQueue>,
    outbounds: Mutex<HashMap<String, Outbound>>,
    results: Mutex<HashMap<String, TestResult>>,
    country_filter: Mutex<Option<String>>,
}

impl BridgeManager {
    pub fn new(
        launcher: Arc<Launcher>,
        checker: Arc<HealthChecker>,
        coordinator: Arc<Coordinator>,
        source: Arc<dyn OutboundProvider>,
        events: EventSender,
        clock: Arc<dyn Clock>,
        order_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            checker,
            coordinator,
            source,
            events,
            clock,
            order_path: order_path.into(),
            bridges: AsyncMutex::new(Vec::new()),
            used_queue: Mutex::new(UsedQueue::new()),
            outbounds: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            country_filter: Mutex::new(None),
        }
    }

    pub fn set_country_filter(&self, filter: Option<String>) {
        *self.country_filter.lock() = filter;
    }

    pub fn events_handle(&self) -> EventSender {
        self.events.clone()
    }

    /// Registers known outbound configs and their latest test results;
    /// called after every `test_batch` so rotation/resize always see the
    /// freshest pool.
    pub fn record(&self, outbounds: &[Outbound], results: &[TestResult]) {
        let mut ob = self.outbounds.lock();
        for o in outbounds {
            ob.insert(o.uri.clone(), o.clone());
        }
        drop(ob);
        let mut rs = self.results.lock();
        for r in results {
            rs.insert(r.uri.clone(), r.clone());
        }
    }

    /// Launches one bridge per outbound in order, skipping any that fail to
    /// come up (logged, not fatal). Returns how many are live afterward.
    pub async fn start(&self, outbounds: Vec<Outbound>) -> usize {
        let _guard = self.coordinator.acquire_rotation().await;
        let mut bridges = self.bridges.lock().await;
        for outbound in outbounds {
            let id = bridges.len();
            match self
                .launcher
                .launch(id, &outbound.uri, &outbound.tag, &outbound.engine_config)
                .await
            {
                Ok(live) => {
                    self.events.emit(StatusEvent::BridgeStarted {
                        id,
                        uri: outbound.uri.clone(),
                        port: live.bridge.local_port,
                    });
                    bridges.push(live);
                }
                Err(err) => {
                    warn!("failed to launch bridge for {}: {err}", outbound.uri);
                    self.events
                        .warn(format!("failed to launch bridge for {}: {err}", outbound.uri));
                }
            }
        }
        let count = bridges.len();
        drop(bridges);
        self.save_order().await;
        count
    }

    /// Tears every live bridge down concurrently rather than one at a time,
    /// so stopping an N-bridge fleet costs one teardown, not N of them.
    pub async fn stop_all(&self) {
        let _guard = self.coordinator.acquire_rotation().await;
        let drained: Vec<LiveBridge> = self.bridges.lock().await.drain(..).collect();

        stream::iter(drained.into_iter().map(|live| {
            let id = live.bridge.id;
            async move {
                self.launcher.teardown(live).await;
                self.events.emit(StatusEvent::BridgeStopped { id });
            }
        }))
        .buffer_unordered(STOP_ALL_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;
    }

    pub async fn live_count(&self) -> usize {
        self.bridges.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<BridgeInfo> {
        self.bridges
            .lock()
            .await
            .iter()
            .map(|l| BridgeInfo {
                id: l.bridge.id,
                uri: l.bridge.uri.clone(),
                tag: l.bridge.tag.clone(),
                port: l.bridge.local_port,
                status: l.bridge.status,
            })
            .collect()
    }

    /// Swaps the backing outbound of `bridge_id` for another `OK` candidate,
    /// preserving its port and id. Returns a human-readable status message
    /// (per the control-plane convention: one line, success/warning/error).
    pub async fn rotate(&self, bridge_id: usize) -> String {
        let _guard = self.coordinator.acquire_rotation().await;
        let mut bridges = self.bridges.lock().await;

        if bridge_id >= bridges.len() {
            return format!(
                "Error: invalid bridge id {bridge_id}. Valid ids: 0..{}",
                bridges.len()
            );
        }

        let mut candidates = self.get_candidates(&bridges);
        if candidates.is_empty() {
            self.events
                .info("No new proxies available. Checking sources...");
            self.reload_and_test(bridges.len() + 10).await;
            candidates = self.get_candidates(&bridges);
        }
        if candidates.is_empty() {
            self.events
                .warn("No candidates after reload; clearing used queue and retrying");
            self.used_queue.lock().clear();
            candidates = self.get_candidates(&bridges);
        }
        if candidates.is_empty() {
            return format!("Error: no available proxies to rotate bridge {bridge_id}");
        }

        let new_outbound = {
            let idx = rand::rng().random_range(0..candidates.len());
            candidates.swap_remove(idx)
        };

        let old = bridges.remove(bridge_id);
        let old_uri = old.bridge.uri.clone();
        let old_port = old.bridge.local_port;
        self.launcher.teardown_keep_port(old).await;

        match self
            .launcher
            .relaunch_on_port(
                bridge_id,
                old_port,
                &new_outbound.uri,
                &new_outbound.tag,
                &new_outbound.engine_config,
            )
            .await
        {
            Ok(live) => {
                bridges.insert(bridge_id, live);
                let mut queue = self.used_queue.lock();
                queue.push(old_uri);
                let queue_size = queue.len();
                drop(queue);
                drop(bridges);
                self.events.emit(StatusEvent::Rotated {
                    id: bridge_id,
                    new_uri: new_outbound.uri.clone(),
                });
                self.save_order().await;
                format!("Rotated bridge {bridge_id} ({queue_size} proxies in history)")
            }
            Err(err) => {
                // the slot that used to hold this bridge is simply gone now;
                // ids are dense indices, stable only while the bridge lives.
                self.launcher.release_port(old_port);
                drop(bridges);
                format!("Error: failed to restart bridge {bridge_id} on port {old_port}: {err}")
            }
        }
    }

    /// Rotates every currently live bridge, in id order. A bridge that drops
    /// out mid-pass (because its own rotation failed) is simply skipped for
    /// the rest of this pass rather than chased across shifted indices.
    pub async fn rotate_all(&self) -> Vec<String> {
        let n = self.live_count().await;
        let mut messages = Vec::with_capacity(n);
        for id in 0..n {
            if id >= self.live_count().await {
                messages.push(format!("Skipped bridge {id}: no longer active"));
                continue;
            }
            messages.push(self.rotate(id).await);
        }
        messages
    }

    /// `adjust_bridge_amount`: grows or shrinks the live set to `target`.
    pub async fn adjust_amount(&self, target: usize) -> String {
        if target < 1 {
            return "Error: amount must be at least 1".to_string();
        }
        let _guard = self.coordinator.acquire_rotation().await;
        let mut bridges = self.bridges.lock().await;
        let current = bridges.len();

        if target == current {
            return format!("Already running {current} bridges");
        }

        if target < current {
            while bridges.len() > target {
                let live = bridges.pop().expect("len > target implies non-empty");
                let id = live.bridge.id;
                self.launcher.teardown(live).await;
                self.events.emit(StatusEvent::BridgeStopped { id });
            }
            let actual = bridges.len();
            drop(bridges);
            self.save_order().await;
            self.events.emit(StatusEvent::Resized { target, actual });
            return format!("Reduced to {target} bridges");
        }

        let needed = target - current;
        let mut candidates = self.get_candidates(&bridges);
        self.sort_by_ping(&mut candidates);
        if candidates.len() < needed {
            self.reload_and_test(target).await;
            candidates = self.get_candidates(&bridges);
            self.sort_by_ping(&mut candidates);
        }

        let mut launched = 0usize;
        for outbound in candidates.into_iter().take(needed) {
            let id = bridges.len();
            match self
                .launcher
                .launch(id, &outbound.uri, &outbound.tag, &outbound.engine_config)
                .await
            {
                Ok(live) => {
                    self.events.emit(StatusEvent::BridgeStarted {
                        id,
                        uri: outbound.uri.clone(),
                        port: live.bridge.local_port,
                    });
                    bridges.push(live);
                    launched += 1;
                }
                Err(err) => {
                    self.events
                        .warn(format!("failed to start extra bridge for {}: {err}", outbound.uri));
                }
            }
        }

        let actual = bridges.len();
        drop(bridges);
        self.save_order().await;
        self.events.emit(StatusEvent::Resized { target, actual });

        if actual == target {
            format!("Increased to {actual} bridges")
        } else if launched == 0 {
            format!("Error: no additional proxies available. Keeping {current} bridges")
        } else {
            format!("Increased to {actual} bridges (requested {target}, limited by available proxies)")
        }
    }

    fn get_candidates(&self, bridges: &[LiveBridge]) -> Vec<Outbound> {
        let outbounds = self.outbounds.lock();
        let results = self.results.lock();
        let used_queue = self.used_queue.lock();
        let country_filter = self.country_filter.lock().clone();

        let live_uris: std::collections::HashSet<&str> =
            bridges.iter().map(|b| b.bridge.uri.as_str()).collect();
        let used_destinations: std::collections::HashSet<(String, u16)> = bridges
            .iter()
            .filter_map(|b| outbounds.get(&b.bridge.uri))
            .map(|o| (o.host.clone(), o.port))
            .collect();

        outbounds
            .values()
            .filter(|o| {
                let result = results.get(&o.uri);
                let is_ok = result.map(|r| r.status == Status::Ok).unwrap_or(false);
                if !is_ok {
                    return false;
                }
                if let Some(filter) = &country_filter {
                    let matches = result
                        .and_then(|r| r.effective_geo())
                        .map(|g| g.label() == filter)
                        .unwrap_or(false);
                    if !matches {
                        return false;
                    }
                }
                if live_uris.contains(o.uri.as_str()) {
                    return false;
                }
                if used_queue.contains(&o.uri) {
                    return false;
                }
                if used_destinations.contains(&(o.host.clone(), o.port)) {
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    fn sort_by_ping(&self, candidates: &mut [Outbound]) {
        let results = self.results.lock();
        candidates.sort_by(|a, b| {
            let pa = results.get(&a.uri).and_then(|r| r.ping_ms).unwrap_or(f64::INFINITY);
            let pb = results.get(&b.uri).and_then(|r| r.ping_ms).unwrap_or(f64::INFINITY);
            pa.total_cmp(&pb)
        });
    }

    async fn reload_and_test(&self, find_first: usize) {
        let fresh = self.source.reload().await;
        if fresh.is_empty() {
            return;
        }
        let mut to_test = Vec::new();
        {
            let mut outbounds = self.outbounds.lock();
            for outbound in fresh {
                to_test.push(outbound.clone());
                outbounds.entry(outbound.uri.clone()).or_insert(outbound);
            }
        }
        let cfg = HealthCheckConfig {
            find_first: Some(find_first),
            country_filter: self.country_filter.lock().clone(),
            ..Default::default()
        };
        let results = self.checker.test_batch(&to_test, &cfg).await;
        let mut map = self.results.lock();
        for result in results {
            map.insert(result.uri.clone(), result);
        }
    }

    /// Best-effort persistence of launch order; never fatal to the caller.
    async fn save_order(&self) {
        let uris: Vec<String> = self
            .bridges
            .lock()
            .await
            .iter()
            .map(|l| l.bridge.uri.clone())
            .collect();
        let _ = self.clock.now();
        if let Some(parent) = self.order_path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!("could not create directory for bridge order file: {err}");
                return;
            }
        }
        match serde_json::to_vec_pretty(&uris) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&self.order_path, bytes).await {
                    warn!("failed to persist bridge order: {err}");
                }
            }
            Err(err) => warn!("failed to serialize bridge order: {err}"),
        }
    }

    /// Best-effort load of the previously persisted order; a missing or
    /// corrupt file is silently treated as "no preference".
    pub async fn load_order(&self) -> Vec<String> {
        match tokio::fs::read(&self.order_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FakeClock;
    use crate::core::event::create_event_channel;
    use crate::core::model::Protocol;
    use crate::engine::port_allocator::OsPortAllocator;
    use crate::engine::spawner::{ProcessSpawner, SpawnedProcess};
    use crate::cache::CacheStore;
    use crate::geo::GeoLookup;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn outbound(uri: &str, host: &str, port: u16) -> Outbound {
        Outbound {
            uri: uri.to_string(),
            tag: "t".to_string(),
            protocol: Protocol::Vless,
            host: host.to_string(),
            port,
            engine_config: json!({"tag": "t", "protocol": "vless", "settings": {}}),
        }
    }

    fn ok_result(uri: &str, ping: f64) -> TestResult {
        let mut r = TestResult::pending(uri);
        r.status = Status::Ok;
        r.ping_ms = Some(ping);
        r.tested_at = Some(1000.0);
        r
    }

    /// Spawner that always succeeds immediately by binding a listener on the
    /// requested port itself (it reads the `-config` file to find the port).
    struct LoopbackSpawner {
        count: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ProcessSpawner for LoopbackSpawner {
        async fn spawn(
            &self,
            _bin: &str,
            args: &[String],
            _workdir: &std::path::Path,
        ) -> std::io::Result<Box<dyn SpawnedProcess>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            let config_path = &args[1];
            let raw = std::fs::read_to_string(config_path)?;
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            let port = value["inbounds"][0]["port"].as_u64().unwrap() as u16;
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            tokio::spawn(async move {
                loop {
                    if listener.accept().await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(DummyProcess))
        }
    }

    struct DummyProcess;

    #[async_trait::async_trait]
    impl SpawnedProcess for DummyProcess {
        fn id(&self) -> Option<u32> {
            Some(1)
        }
        fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
            Ok(None)
        }
        async fn kill(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
            std::future::pending().await
        }
    }

    fn test_manager(dir: &std::path::Path) -> BridgeManager {
        let clock = Arc::new(FakeClock::new(1000.0));
        let allocator = Arc::new(OsPortAllocator::new());
        let spawner = Arc::new(LoopbackSpawner { count: AtomicU32::new(0) });
        let launcher = Arc::new(Launcher::new("fake-engine", allocator, spawner));
        let cache = Arc::new(CacheStore::new(dir.join("cache.json"), clock.clone()));
        let geo = Arc::new(GeoLookup::new(dir.join("geo.json"), None, clock.clone()));
        let (tx, _rx) = create_event_channel();
        let checker = Arc::new(HealthChecker::new(launcher.clone(), cache, geo, tx.clone(), clock.clone()));
        let coordinator = Arc::new(Coordinator::new());
        BridgeManager::new(
            launcher,
            checker,
            coordinator,
            Arc::new(NoSources),
            tx,
            clock,
            dir.join("bridge_order.json"),
        )
    }

    #[tokio::test]
    async fn start_launches_one_bridge_per_outbound() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        let outbounds = vec![
            outbound("vless://a", "1.1.1.1", 443),
            outbound("vless://b", "2.2.2.2", 443),
        ];
        let count = manager.start(outbounds).await;
        assert_eq!(count, 2);
        assert_eq!(manager.live_count().await, 2);
    }

    #[tokio::test]
    async fn rotate_preserves_port_and_picks_a_new_uri() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.record(
            &[outbound("vless://b", "2.2.2.2", 443)],
            &[ok_result("vless://b", 50.0)],
        );
        manager.start(vec![outbound("vless://a", "1.1.1.1", 443)]).await;
        let before_port = manager.snapshot().await[0].port;

        let msg = manager.rotate(0).await;
        assert!(msg.starts_with("Rotated"), "unexpected message: {msg}");

        let after = manager.snapshot().await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].port, before_port);
        assert_eq!(after[0].uri, "vless://b");
    }

    #[tokio::test]
    async fn rotate_fails_cleanly_with_no_candidates() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.start(vec![outbound("vless://a", "1.1.1.1", 443)]).await;
        let msg = manager.rotate(0).await;
        assert!(msg.starts_with("Error:"), "unexpected message: {msg}");
    }

    #[tokio::test]
    async fn adjust_amount_grows_and_shrinks() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.record(
            &[
                outbound("vless://b", "2.2.2.2", 443),
                outbound("vless://c", "3.3.3.3", 443),
            ],
            &[ok_result("vless://b", 10.0), ok_result("vless://c", 20.0)],
        );
        manager.start(vec![outbound("vless://a", "1.1.1.1", 443)]).await;

        let msg = manager.adjust_amount(3).await;
        assert!(msg.starts_with("Increased"), "unexpected message: {msg}");
        assert_eq!(manager.live_count().await, 3);

        let msg = manager.adjust_amount(1).await;
        assert!(msg.starts_with("Reduced"), "unexpected message: {msg}");
        assert_eq!(manager.live_count().await, 1);

        let msg = manager.adjust_amount(1).await;
        assert_eq!(msg, "Already running 1 bridges");
    }

    // Property 1 — port exclusivity: every concurrently live bridge gets a
    // distinct local port.
    #[tokio::test]
    async fn live_bridges_never_share_a_port() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        let outbounds = vec![
            outbound("vless://a", "1.1.1.1", 443),
            outbound("vless://b", "2.2.2.2", 443),
            outbound("vless://c", "3.3.3.3", 443),
        ];
        manager.start(outbounds).await;
        let ports: Vec<u16> = manager.snapshot().await.iter().map(|b| b.port).collect();
        let unique: std::collections::HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(ports.len(), unique.len(), "duplicate ports among live bridges: {ports:?}");
    }

    // Property 3 — destination novelty: rotation never lands on a (host,
    // port) destination already in use by another live bridge.
    #[tokio::test]
    async fn rotation_avoids_destinations_already_in_use() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.record(
            &[outbound("vless://dup", "1.1.1.1", 443)], // same (host, port) as bridge 0
            &[ok_result("vless://dup", 5.0)],
        );
        manager.start(vec![outbound("vless://a", "1.1.1.1", 443)]).await;

        let msg = manager.rotate(0).await;
        assert!(msg.starts_with("Error:"), "expected no eligible candidate, got: {msg}");
    }

    // Property 10 — resize idempotence: adjusting to the already-current
    // amount is a no-op.
    #[tokio::test]
    async fn adjust_amount_to_current_size_is_a_no_op() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.start(vec![outbound("vless://a", "1.1.1.1", 443)]).await;
        let before = manager.snapshot().await;

        let msg = manager.adjust_amount(1).await;
        assert_eq!(msg, "Already running 1 bridges");
        let after = manager.snapshot().await;
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].port, after[0].port);
        assert_eq!(before[0].uri, after[0].uri);
    }

    #[tokio::test]
    async fn bridge_order_persists_across_instances() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.start(vec![outbound("vless://a", "1.1.1.1", 443)]).await;
        let order = manager.load_order().await;
        assert_eq!(order, vec!["vless://a".to_string()]);
    }
}
