//! Core data model: Outbound / TestResult / Geo / Bridge / CacheEntry / UsedQueue / Sources.
//! Status is a sum type throughout rather than a loosely-shaped map.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported outbound protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
        };
        write!(f, "{s}")
    }
}

/// A normalized, engine-agnostic outbound proxy description.
///
/// Immutable: once built by the parser, fields never change. It's only
/// dropped when its `uri` is evicted from the active set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outbound {
    /// Canonical URI; the process-wide primary key.
    pub uri: String,
    /// Sanitized tag, length <= 48, charset [A-Za-z0-9._ -].
    pub tag: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Engine outbound config fragment, deterministically rendered by the protocol-specific builder.
    pub engine_config: Value,
}

/// Health-check result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pending,
    Ok,
    Error,
    Filtered,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "PENDING",
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Filtered => "FILTERED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Status::Pending),
            "OK" => Ok(Status::Ok),
            "ERROR" => Ok(Status::Error),
            "FILTERED" => Ok(Status::Filtered),
            _ => Err(()),
        }
    }
}

/// IP geolocation info; equality is based on `ip` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geo {
    pub ip: String,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
}

impl Geo {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            country_code: None,
            country_name: None,
        }
    }

    /// `country_name ?? country_code ?? "Unknown"`.
    pub fn label(&self) -> &str {
        self.country_name
            .as_deref()
            .or(self.country_code.as_deref())
            .unwrap_or("Unknown")
    }
}

impl PartialEq for Geo {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}
impl Eq for Geo {}

impl std::hash::Hash for Geo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
    }
}

/// The most recent probe result for a single outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub uri: String,
    pub status: Status,
    pub ping_ms: Option<f64>,
    pub error: Option<String>,
    pub server_geo: Option<Geo>,
    pub exit_geo: Option<Geo>,
    /// Epoch seconds.
    pub tested_at: Option<f64>,
}

impl TestResult {
    pub fn pending(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            status: Status::Pending,
            ping_ms: None,
            error: None,
            server_geo: None,
            exit_geo: None,
            tested_at: None,
        }
    }

    /// `status = OK ⇒ ping_ms ≠ null ∧ tested_at ≠ null`.
    pub fn is_well_formed(&self) -> bool {
        if self.status == Status::Ok {
            self.ping_ms.is_some() && self.tested_at.is_some()
        } else {
            true
        }
    }

    /// Falls back to server_geo when exit_geo is absent — per spec §4.3 filtering rule
    pub fn effective_geo(&self) -> Option<&Geo> {
        self.exit_geo.as_ref().or(self.server_geo.as_ref())
    }
}

/// Bridge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Starting,
    Live,
    Dead,
}

/// Runtime info for the local listener bound to a single outbound.
#[derive(Debug)]
pub struct Bridge {
    /// Dense index into the current bridge vector. Stable while it lives,
    /// may be reassigned once the bridge is torn down.
    pub id: usize,
    pub uri: String,
    pub tag: String,
    pub local_port: u16,
    pub engine_pid: Option<u32>,
    pub workdir: PathBuf,
    pub status: BridgeStatus,
}

/// Version tag for the on-disk cache entry shape.
pub const CACHE_VERSION: u32 = 1;

/// Persisted view of a test result; only entries with `tested_at.is_some()` are written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub uri: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<f64>,
    pub tested_at_ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_geo: Option<Geo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_geo: Option<Geo>,
}

impl CacheEntry {
    /// Built from a completed TestResult (`tested_at.is_some()`); incomplete
    /// results have no corresponding cache entry.
    pub fn from_result(result: &TestResult) -> Option<Self> {
        let tested_at_ts = result.tested_at?;
        Some(Self {
            uri: result.uri.clone(),
            status: result.status,
            ping: result.ping_ms,
            tested_at_ts,
            server_geo: result.server_geo.clone(),
            exit_geo: result.exit_geo.clone(),
        })
    }

    pub fn to_result(&self) -> TestResult {
        TestResult {
            uri: self.uri.clone(),
            status: self.status,
            ping_ms: self.ping,
            error: None,
            server_geo: self.server_geo.clone(),
            exit_geo: self.exit_geo.clone(),
            tested_at: Some(self.tested_at_ts),
        }
    }
}

/// Bounded FIFO of URIs evicted by rotation; capacity 100, drops from the tail when full.
#[derive(Debug, Default)]
pub struct UsedQueue {
    inner: VecDeque<String>,
}

pub const USED_QUEUE_CAPACITY: usize = 100;

impl UsedQueue {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::with_capacity(USED_QUEUE_CAPACITY),
        }
    }

    pub fn push(&mut self, uri: String) {
        if self.inner.len() >= USED_QUEUE_CAPACITY {
            self.inner.pop_back();
        }
        self.inner.push_front(uri);
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.inner.iter().any(|u| u == uri)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// A user-supplied source endpoint: a file path or an HTTP URL.
#[derive(Debug, Clone)]
pub enum SourceKind {
    File(PathBuf),
    Http(String),
}

/// Index doubles as the user-visible source id.
#[derive(Debug, Clone)]
pub struct Sources {
    entries: Vec<SourceKind>,
}

impl Sources {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, kind: SourceKind) -> usize {
        self.entries.push(kind);
        self.entries.len() - 1
    }

    pub fn remove(&mut self, id: usize) -> Option<SourceKind> {
        if id < self.entries.len() {
            Some(self.entries.remove(id))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &SourceKind)> {
        self.entries.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Sources {
    fn default() -> Self {
        Self::new()
    }
}
