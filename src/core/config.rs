//! Layered configuration loading: `config.toml` -> environment overrides ->
//! built-in defaults. Never fails on a missing file or missing field.

use std::path::{Path, PathBuf};

use bon::Builder;
use config::{Config, File};
use serde::Deserialize;

use crate::core::error::Result;

#[derive(Debug, Deserialize, Builder, Clone)]
pub struct AppConfig {
    /// Cache/state persistence directory; falls back to the platform XDG config dir when unset.
    #[serde(default)]
    pub config_dir: Option<String>,

    /// Explicit engine binary path; falls back to XRAY_PATH -> "xray" -> "v2ray" when unset.
    #[serde(default)]
    pub engine_bin: Option<String>,

    #[serde(default = "default_test_url")]
    pub test_url: String,

    #[serde(default = "default_phase1_timeout")]
    pub phase1_timeout_secs: f64,
    #[serde(default = "default_phase1_concurrency")]
    pub phase1_concurrency: usize,

    #[serde(default = "default_phase2_timeout")]
    pub phase2_timeout_secs: f64,
    #[serde(default = "default_phase2_concurrency")]
    pub phase2_concurrency: usize,

    #[serde(default = "default_launch_retries")]
    pub launch_retries: u32,

    #[serde(default = "default_geo_concurrency")]
    pub geo_concurrency: usize,

    /// FindIP.net token; overridden by the FINDIP_TOKEN environment variable.
    #[serde(default)]
    pub findip_token: Option<String>,
}

fn default_test_url() -> String {
    "https://www.cloudflare.com/cdn-cgi/trace".to_string()
}
fn default_phase1_timeout() -> f64 {
    1.0
}
fn default_phase1_concurrency() -> usize {
    100
}
fn default_phase2_timeout() -> f64 {
    3.0
}
fn default_phase2_concurrency() -> usize {
    20
}
fn default_launch_retries() -> u32 {
    5
}
fn default_geo_concurrency() -> usize {
    20
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_dir: None,
            engine_bin: None,
            test_url: default_test_url(),
            phase1_timeout_secs: default_phase1_timeout(),
            phase1_concurrency: default_phase1_concurrency(),
            phase2_timeout_secs: default_phase2_timeout(),
            phase2_concurrency: default_phase2_concurrency(),
            launch_retries: default_launch_retries(),
            geo_concurrency: default_geo_concurrency(),
            findip_token: None,
        }
    }
}

impl AppConfig {
    /// Loads `config.toml` if present, layering environment overrides on top; never fails on a missing file.
    pub fn load() -> Result<Self> {
        let config_path = Path::new("config.toml");
        let builder = Config::builder();

        let builder = if config_path.exists() {
            builder.add_source(File::from(config_path))
        } else {
            builder
        };

        let settings = builder.build()?;
        let mut app: AppConfig = match settings.try_deserialize() {
            Ok(cfg) => cfg,
            Err(_) => AppConfig::default(),
        };

        if let Ok(token) = std::env::var("FINDIP_TOKEN") {
            app.findip_token = Some(token);
        }
        if let Ok(path) = std::env::var("XRAY_PATH") {
            app.engine_bin = Some(path);
        }

        Ok(app)
    }

    /// Root directory for persisted state: `<config_dir>/{proxy_cache.json, geo_cache.json, chains.txt, config.json}`.
    pub fn resolve_config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return PathBuf::from(shellexpand_tilde(dir));
        }
        directories::ProjectDirs::from("", "", "nyxproxy")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".nyxproxy"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.resolve_config_dir().join("proxy_cache.json")
    }

    pub fn geo_cache_path(&self) -> PathBuf {
        self.resolve_config_dir().join("geo_cache.json")
    }

    pub fn chains_path(&self) -> PathBuf {
        self.resolve_config_dir().join("chains.txt")
    }
}

fn shellexpand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = directories::UserDirs::new() {
            return home.home_dir().join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
