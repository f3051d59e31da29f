//! Load Balancer (H): a single local TCP listener that fans out across the
//! live bridge pool, splicing raw bytes between each client and a freshly
//! opened connection to the chosen bridge's port. Grounded on
//! `load_balancer.py`'s `BridgeLoadBalancer` (strategy selection, stats,
//! per-direction relay) and on the `ServiceContext` pattern of a
//! `CancellationToken` carried alongside long-lived state for shutdown.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::event::{EventSender, StatusEvent};

const RELAY_BUFFER: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Random,
    RoundRobin,
    LeastConn,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Strategy::Random),
            "round-robin" => Ok(Strategy::RoundRobin),
            "least-conn" => Ok(Strategy::LeastConn),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConn => "least-conn",
        };
        write!(f, "{s}")
    }
}

/// A bridge as the balancer sees it: just enough to dial and to key stats by.
#[derive(Debug, Clone, Copy)]
pub struct BridgeTarget {
    pub id: usize,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeStat {
    pub total: u64,
    pub active: u64,
}

#[derive(Debug, Default)]
struct Stats {
    total_connections: u64,
    active_connections: u64,
    per_bridge: HashMap<usize, BridgeStat>,
}

#[derive(Debug, Clone)]
pub struct BalancerStats {
    pub port: u16,
    pub strategy: Strategy,
    pub total_connections: u64,
    pub active_connections: u64,
    pub bridge_stats: HashMap<usize, BridgeStat>,
}

pub struct LoadBalancer {
    port: u16,
    strategy: Strategy,
    bridges: Vec<BridgeTarget>,
    stats: Mutex<Stats>,
    round_robin_idx: AtomicUsize,
    active: AtomicBool,
    shutdown: CancellationToken,
    events: EventSender,
}

impl LoadBalancer {
    pub fn new(bridges: Vec<BridgeTarget>, port: u16, strategy: Strategy, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            port,
            strategy,
            bridges,
            stats: Mutex::new(Stats::default()),
            round_robin_idx: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            events,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Binds the listener and spawns the accept loop. Refuses to start with
    /// an empty bridge set or a port already in use.
    pub async fn start(self: &Arc<Self>) -> Result<(), String> {
        if self.bridges.is_empty() {
            return Err("no bridges available; start bridges first".to_string());
        }
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|err| format!("port {} is already in use: {err}", self.port))?;

        self.active.store(true, Ordering::SeqCst);
        self.events.emit(StatusEvent::BalancerStarted {
            port: self.port,
            strategy: self.strategy.to_string(),
        });

        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(listener).await });
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.events.emit(StatusEvent::BalancerStopped);
    }

    pub fn stats(&self) -> BalancerStats {
        let stats = self.stats.lock();
        BalancerStats {
            port: self.port,
            strategy: self.strategy,
            total_connections: stats.total_connections,
            active_connections: stats.active_connections,
            bridge_stats: stats.per_bridge.clone(),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_client(stream).await });
                        }
                        Err(err) => {
                            warn!("load balancer accept error: {err}");
                        }
                    }
                }
            }
        }
    }

    fn select_bridge(&self) -> Option<BridgeTarget> {
        if self.bridges.is_empty() {
            return None;
        }
        match self.strategy {
            Strategy::Random => {
                let idx = rand::rng().random_range(0..self.bridges.len());
                Some(self.bridges[idx])
            }
            Strategy::RoundRobin => {
                let idx = self.round_robin_idx.fetch_add(1, Ordering::SeqCst) % self.bridges.len();
                Some(self.bridges[idx])
            }
            Strategy::LeastConn => {
                let stats = self.stats.lock();
                let min_active = self
                    .bridges
                    .iter()
                    .map(|b| stats.per_bridge.get(&b.id).map(|s| s.active).unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                let candidates: Vec<&BridgeTarget> = self
                    .bridges
                    .iter()
                    .filter(|b| stats.per_bridge.get(&b.id).map(|s| s.active).unwrap_or(0) == min_active)
                    .collect();
                drop(stats);
                let idx = rand::rng().random_range(0..candidates.len());
                Some(*candidates[idx])
            }
        }
    }

    async fn handle_client(self: Arc<Self>, client: TcpStream) {
        if !self.is_active() {
            return;
        }
        let Some(target) = self.select_bridge() else {
            return;
        };

        {
            let mut stats = self.stats.lock();
            stats.total_connections += 1;
            stats.active_connections += 1;
            let entry = stats.per_bridge.entry(target.id).or_default();
            entry.total += 1;
            entry.active += 1;
        }

        match TcpStream::connect(("127.0.0.1", target.port)).await {
            Ok(upstream) => {
                let (mut client_r, mut client_w) = client.into_split();
                let (mut bridge_r, mut bridge_w) = upstream.into_split();
                let client_to_bridge = relay(&mut client_r, &mut bridge_w);
                let bridge_to_client = relay(&mut bridge_r, &mut client_w);
                let _ = tokio::join!(client_to_bridge, bridge_to_client);
            }
            Err(err) => {
                debug!("failed to dial bridge {} on port {}: {err}", target.id, target.port);
            }
        }

        let mut stats = self.stats.lock();
        stats.active_connections = stats.active_connections.saturating_sub(1);
        if let Some(entry) = stats.per_bridge.get_mut(&target.id) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

/// Pumps bytes in one direction until EOF or error, 8 KiB at a time.
async fn relay(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
) {
    let mut buf = [0u8; RELAY_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
