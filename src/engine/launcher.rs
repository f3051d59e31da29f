//! Engine Launcher (D): spawns the engine subprocess for a bridge, polls its
//! listener, and tears it down. Grounded on `SingBoxController` (spawn with
//! `kill_on_drop`, poll-then-timeout readiness check) generalized to this
//! bridge lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::warn;

use crate::core::error::XrayError;
use crate::core::model::{Bridge, BridgeStatus};
use crate::engine::config_render::render_engine_config;
use crate::engine::port_allocator::PortAllocator;
use crate::engine::spawner::{ProcessSpawner, SpawnedProcess};

const LISTEN_DEADLINE: Duration = Duration::from_millis(2000);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_LAUNCH_ATTEMPTS: u32 = 5;

/// Releases an allocated port on drop unless `disarm`ed. Covers both the
/// `Err` return path and a `launch()` future dropped mid-flight (e.g. by
/// `find_first` cancellation) — either way the port comes back to the pool.
struct PortGuard<'a> {
    port: u16,
    allocator: &'a dyn PortAllocator,
    disarmed: bool,
}

impl<'a> PortGuard<'a> {
    fn new(port: u16, allocator: &'a dyn PortAllocator) -> Self {
        Self { port, allocator, disarmed: false }
    }

    fn disarm(mut self) -> u16 {
        self.disarmed = true;
        self.port
    }
}

impl Drop for PortGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            self.allocator.release(self.port);
        }
    }
}

/// A bridge with its live subprocess and workdir still attached. The workdir
/// is removed automatically when this value (and its `TempDir`) is dropped.
pub struct LiveBridge {
    pub bridge: Bridge,
    process: Box<dyn SpawnedProcess>,
    _workdir: TempDir,
}

pub struct Launcher {
    engine_bin: String,
    port_allocator: Arc<dyn PortAllocator>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl Launcher {
    pub fn new(
        engine_bin: impl Into<String>,
        port_allocator: Arc<dyn PortAllocator>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Self {
            engine_bin: engine_bin.into(),
            port_allocator,
            spawner,
        }
    }

    /// Launches a bridge for `outbound_config`, retrying on failure with
    /// exponential-ish backoff starting at 100ms.
    pub async fn launch(
        &self,
        id: usize,
        uri: &str,
        tag: &str,
        outbound_config: &Value,
    ) -> Result<LiveBridge, XrayError> {
        let mut last_err = None;
        for attempt in 0..MAX_LAUNCH_ATTEMPTS {
            if attempt > 0 {
                let backoff_ms = 100u64 * 2u64.pow((attempt - 1).min(4));
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            match self.try_launch_once(id, uri, tag, outbound_config).await {
                Ok(live) => return Ok(live),
                Err(err) => {
                    warn!("engine launch attempt {} for {uri} failed: {err}", attempt + 1);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(XrayError::BinaryNotFound(self.engine_bin.clone())))
    }

    async fn try_launch_once(
        &self,
        id: usize,
        uri: &str,
        tag: &str,
        outbound_config: &Value,
    ) -> Result<LiveBridge, XrayError> {
        let port = self.port_allocator.allocate()?;
        let guard = PortGuard::new(port, self.port_allocator.as_ref());
        let (process, workdir) = self.spawn_and_wait(port, outbound_config).await?;
        let port = guard.disarm();
        Ok(LiveBridge {
            bridge: Bridge {
                id,
                uri: uri.to_string(),
                tag: tag.to_string(),
                local_port: port,
                engine_pid: process.id(),
                workdir: workdir.path().to_path_buf(),
                status: BridgeStatus::Live,
            },
            process,
            _workdir: workdir,
        })
    }

    /// Relaunches on a port the caller already holds (rotation preserves the
    /// port a bridge was assigned). The port is never passed to the
    /// allocator, so it must already be excluded from fresh allocation by
    /// the caller (it still sits in `OsPortAllocator`'s reserved set from
    /// the bridge this is replacing).
    pub async fn relaunch_on_port(
        &self,
        id: usize,
        port: u16,
        uri: &str,
        tag: &str,
        outbound_config: &Value,
    ) -> Result<LiveBridge, XrayError> {
        let mut last_err = None;
        for attempt in 0..MAX_LAUNCH_ATTEMPTS {
            if attempt > 0 {
                let backoff_ms = 100u64 * 2u64.pow((attempt - 1).min(4));
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            match self.spawn_and_wait(port, outbound_config).await {
                Ok((process, workdir)) => {
                    return Ok(LiveBridge {
                        bridge: Bridge {
                            id,
                            uri: uri.to_string(),
                            tag: tag.to_string(),
                            local_port: port,
                            engine_pid: process.id(),
                            workdir: workdir.path().to_path_buf(),
                            status: BridgeStatus::Live,
                        },
                        process,
                        _workdir: workdir,
                    });
                }
                Err(err) => {
                    warn!("relaunch attempt {} for {uri} on port {port} failed: {err}", attempt + 1);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(XrayError::ListenTimeout { port }))
    }

    /// Releases a port without going through a `LiveBridge` teardown; used
    /// when a relaunch attempt fails and the port has nothing left to back it.
    pub fn release_port(&self, port: u16) {
        self.port_allocator.release(port);
    }

    async fn spawn_and_wait(
        &self,
        port: u16,
        outbound_config: &Value,
    ) -> Result<(Box<dyn SpawnedProcess>, TempDir), XrayError> {
        let workdir = tempfile::Builder::new()
            .prefix("nyxproxy-bridge-")
            .tempdir()
            .map_err(XrayError::Spawn)?;

        let config = render_engine_config(port, outbound_config);
        let config_path = workdir.path().join("config.json");
        let rendered = serde_json::to_vec_pretty(&config)
            .map_err(|err| XrayError::ConfigRender(err.to_string()))?;
        tokio::fs::write(&config_path, rendered)
            .await
            .map_err(XrayError::Spawn)?;

        let args = vec![
            "-config".to_string(),
            config_path.to_string_lossy().into_owned(),
        ];
        let mut process = self
            .spawner
            .spawn(&self.engine_bin, &args, workdir.path())
            .await
            .map_err(|_| XrayError::BinaryNotFound(self.engine_bin.clone()))?;

        if self.wait_for_listener(port, process.as_mut()).await {
            Ok((process, workdir))
        } else {
            let _ = process.kill().await;
            Err(XrayError::ListenTimeout { port })
        }
    }

    async fn wait_for_listener(&self, port: u16, process: &mut dyn SpawnedProcess) -> bool {
        let deadline = Instant::now() + LISTEN_DEADLINE;
        while Instant::now() < deadline {
            if matches!(process.try_wait(), Ok(Some(_))) {
                return false;
            }
            let connected = timeout(Duration::from_millis(200), TcpStream::connect(("127.0.0.1", port)))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if connected {
                return true;
            }
            sleep(POLL_INTERVAL).await;
        }
        false
    }

    /// Kills the engine process outright and releases its port. There is no
    /// graceful-shutdown hook to ask the engine for, so `kill` is the hard
    /// stop rather than a last resort after a wait.
    pub async fn teardown(&self, mut live: LiveBridge) {
        let _ = live.process.kill().await;
        self.port_allocator.release(live.bridge.local_port);
    }

    /// Same shutdown as `teardown`, but keeps the port reserved — used by
    /// rotation, which tears down the old process and immediately relaunches
    /// on the same port under the same rotation-lock hold.
    pub async fn teardown_keep_port(&self, mut live: LiveBridge) {
        let _ = live.process.kill().await;
    }

    pub fn workdir_of(live: &LiveBridge) -> PathBuf {
        live.bridge.workdir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::port_allocator::OsPortAllocator;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    /// A fake process that never exits on its own; the test controls
    /// whether/when a listener opens on the target port.
    struct FakeProcess {
        killed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl SpawnedProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(1234)
        }
        fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
            Ok(None)
        }
        async fn kill(&mut self) -> std::io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
            std::future::pending().await
        }
    }

    struct FakeSpawner {
        killed: Arc<AtomicBool>,
        opened_listener: Arc<StdMutex<Option<TcpListener>>>,
    }

    #[async_trait::async_trait]
    impl ProcessSpawner for FakeSpawner {
        async fn spawn(
            &self,
            _bin: &str,
            _args: &[String],
            _workdir: &std::path::Path,
        ) -> std::io::Result<Box<dyn SpawnedProcess>> {
            // simulate the engine opening its listener shortly after spawn
            if let Some(listener) = self.opened_listener.lock().unwrap().take() {
                tokio::spawn(async move {
                    // keep the listener alive for the duration of the test
                    loop {
                        if listener.accept().await.is_err() {
                            break;
                        }
                    }
                });
            }
            Ok(Box::new(FakeProcess {
                killed: self.killed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn launch_succeeds_once_listener_opens() {
        let allocator = OsPortAllocator::new();
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        // rebind the same port under a listener the fake spawner will serve
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        let killed = Arc::new(AtomicBool::new(false));
        let spawner = Arc::new(FakeSpawner {
            killed: killed.clone(),
            opened_listener: Arc::new(StdMutex::new(Some(listener))),
        });

        struct FixedPortAllocator(u16);
        impl PortAllocator for FixedPortAllocator {
            fn allocate(&self) -> Result<u16, XrayError> {
                Ok(self.0)
            }
            fn release(&self, _port: u16) {}
        }

        let launcher = Launcher::new("fake-engine", Arc::new(FixedPortAllocator(port)), spawner);
        let outbound = json!({"tag": "t1", "protocol": "vless", "settings": {}});
        let live = launcher.launch(0, "vless://x", "t1", &outbound).await.unwrap();
        assert_eq!(live.bridge.local_port, port);
        assert_eq!(live.bridge.status, BridgeStatus::Live);

        launcher.teardown(live).await;
        assert!(killed.load(Ordering::SeqCst));
    }

    #[test]
    fn port_guard_releases_on_drop_unless_disarmed() {
        struct TrackingAllocator(Arc<AtomicBool>);
        impl PortAllocator for TrackingAllocator {
            fn allocate(&self) -> Result<u16, XrayError> {
                Ok(4242)
            }
            fn release(&self, _port: u16) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        {
            let allocator = TrackingAllocator(released.clone());
            let _guard = PortGuard::new(4242, &allocator);
        }
        assert!(released.load(Ordering::SeqCst), "an un-disarmed guard must release its port on drop");

        let released = Arc::new(AtomicBool::new(false));
        {
            let allocator = TrackingAllocator(released.clone());
            let guard = PortGuard::new(4242, &allocator);
            let _ = guard.disarm();
        }
        assert!(!released.load(Ordering::SeqCst), "a disarmed guard must not release its port");
    }

    // Mirrors the real bug: `find_first` cancellation drops the in-flight
    // `launch()` future while it's still inside `spawn_and_wait`. The
    // reserved port must come back regardless.
    #[tokio::test]
    async fn cancelling_launch_mid_flight_releases_the_port() {
        struct PendingSpawner;

        #[async_trait::async_trait]
        impl ProcessSpawner for PendingSpawner {
            async fn spawn(
                &self,
                _bin: &str,
                _args: &[String],
                _workdir: &std::path::Path,
            ) -> std::io::Result<Box<dyn SpawnedProcess>> {
                std::future::pending().await
            }
        }

        struct TrackingAllocator(Arc<AtomicBool>);
        impl PortAllocator for TrackingAllocator {
            fn allocate(&self) -> Result<u16, XrayError> {
                Ok(5555)
            }
            fn release(&self, _port: u16) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let launcher = Launcher::new(
            "fake-engine",
            Arc::new(TrackingAllocator(released.clone())),
            Arc::new(PendingSpawner),
        );
        let outbound = json!({"tag": "t1", "protocol": "vless", "settings": {}});

        let launch_fut = launcher.launch(0, "vless://x", "t1", &outbound);
        tokio::pin!(launch_fut);
        tokio::select! {
            _ = &mut launch_fut => panic!("spawn never resolves, so launch must not complete here"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        drop(launch_fut);

        assert!(released.load(Ordering::SeqCst), "dropping an in-flight launch must release its reserved port");
    }
}
