//! Error taxonomy for the core domain, plus the crate-wide `Result` alias.
//! Propagation strategy is documented in DESIGN.md.

use thiserror::Error;

/// Top-level domain error.
#[derive(Error, Debug)]
pub enum NyxProxyError {
    #[error("failed to parse proxy URI: {0}")]
    ProxyParsing(#[from] ProxyParsingError),

    #[error("engine error: {0}")]
    Engine(#[from] XrayError),

    #[error("proxychains error: {0}")]
    ProxyChains(#[from] ProxyChainsError),

    #[error("insufficient proxies: need {needed}, have {available}")]
    InsufficientProxies { needed: usize, available: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, NyxProxyError>;

/// A single failed URI line. Callers must never let one bad line abort a batch parse.
#[derive(Error, Debug, Clone)]
#[error("line {line}: {reason}")]
pub struct ProxyParsingError {
    pub line: usize,
    pub reason: String,
}

impl ProxyParsingError {
    pub fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

/// Errors from the engine subprocess (xray/v2ray); scoped to the single bridge that triggered them.
#[derive(Error, Debug)]
pub enum XrayError {
    #[error("engine binary not found (searched: {0})")]
    BinaryNotFound(String),

    #[error("engine process exited before its listener opened (port {port})")]
    ListenTimeout { port: u16 },

    #[error("engine process exited with status {0}")]
    ProcessExited(std::process::ExitStatus),

    #[error("failed to spawn engine process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("config render failed: {0}")]
    ConfigRender(String),

    #[error("no free port available after {attempts} attempts")]
    PortExhausted { attempts: u32 },
}

/// proxychains adapter errors; fatal to the `chains` subcommand, irrelevant to everything else.
#[derive(Error, Debug)]
pub enum ProxyChainsError {
    #[error("proxychains binary not found")]
    BinaryNotFound,

    #[error("failed to render proxychains config: {0}")]
    ConfigRender(#[from] std::io::Error),

    #[error("failed to exec proxychains: {0}")]
    Exec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_error_preserves_line_number() {
        let err = ProxyParsingError::new(3, "missing host");
        assert_eq!(err.line, 3);
        assert_eq!(err.to_string(), "line 3: missing host");
    }

    #[test]
    fn insufficient_proxies_message_includes_counts() {
        let err = NyxProxyError::InsufficientProxies {
            needed: 5,
            available: 2,
        };
        assert!(err.to_string().contains('5'));
        assert!(err.to_string().contains('2'));
    }
}
