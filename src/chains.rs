//! Proxychains adapter: renders a `[ProxyList]` config to a temp directory
//! and execs a command through `proxychains4`/`proxychains`, inheriting
//! stdio. Grounded on `chains.py`'s `ChainsMixin.run_with_chains` (fixed
//! template, binary lookup, temp config file); this is a fresh launch that
//! tears down on exit rather than reusing a running bridge set.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::core::error::ProxyChainsError;

const CONF_TEMPLATE: &str = "\
# proxychains.conf generated by nyxproxy
random_chain
proxy_dns
remote_dns_subnet 224
tcp_read_time_out 15000
tcp_connect_time_out 8000
[ProxyList]
{proxy_list}
";

/// Locates `proxychains4` or `proxychains` on `PATH`, preferring the former.
fn which_proxychains() -> Result<String, ProxyChainsError> {
    for candidate in ["proxychains4", "proxychains"] {
        if find_on_path(candidate).is_some() {
            return Ok(candidate.to_string());
        }
    }
    Err(ProxyChainsError::BinaryNotFound)
}

fn find_on_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(bin);
        candidate.is_file().then_some(candidate)
    })
}

/// Renders the `[ProxyList]` config for the given bridge ports into a fresh
/// temp directory. The directory is returned so the caller can keep it
/// alive (and therefore the file on disk) for the lifetime of the child.
fn render_config(ports: &[u16]) -> std::io::Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::Builder::new().prefix("nyxproxy_chains_").tempdir()?;
    let proxy_list = ports
        .iter()
        .map(|port| format!("http 127.0.0.1 {port}"))
        .collect::<Vec<_>>()
        .join("\n");
    let content = CONF_TEMPLATE.replace("{proxy_list}", &proxy_list);
    let config_path = dir.path().join("proxychains.conf");
    std::fs::write(&config_path, content)?;
    Ok((dir, config_path))
}

/// Runs `cmd` through proxychains against the given bridge ports, inheriting
/// stdio, and returns the child's exit code. Callers are expected to have
/// already started the bridges the ports belong to and to tear them down
/// once this returns.
pub async fn run_with_chains(ports: &[u16], cmd: &[String]) -> Result<i32, ProxyChainsError> {
    if cmd.is_empty() {
        return Err(ProxyChainsError::Exec("no command specified".to_string()));
    }
    let bin = which_proxychains()?;
    let (_dir, config_path) = render_config(ports)?;

    let status = Command::new(&bin)
        .arg("-f")
        .arg(&config_path)
        .args(cmd)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|err| ProxyChainsError::Exec(err.to_string()))?;

    Ok(status.code().unwrap_or(1))
}
