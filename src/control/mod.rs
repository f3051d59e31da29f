//! Control Plane (I): a single-writer command processor consuming lines of
//! text, per the grammar in the manager's command surface. Grounded on the
//! verb surface of `cli.py`/the interactive loop, reworked as a pure
//! parse step (`parse_command`) plus a dispatcher that drives the Bridge
//! Manager (G) and Load Balancer (H).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::balancer::{BridgeTarget, LoadBalancer, Strategy};
use crate::bridge::manager::BridgeManager;
use crate::core::model::{SourceKind, Sources};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateTarget {
    Id(usize),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    ProxyRotate(RotateTarget),
    ProxyAmount(usize),
    BridgeOn { port: u16, strategy: Strategy },
    BridgeOff,
    BridgeStats,
    SourceAdd(String),
    SourceRem(usize),
    SourceList,
    Exit,
}

const HELP_TEXT: &str = "\
Commands:
  help
  proxy rotate <id|all>
  proxy amount <N>
  bridge on <port> [strategy]
  bridge off
  bridge stats
  source add <url>
  source rem <id>
  source list
  ESC";

pub fn parse_command(line: &str) -> Result<Command, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let verb = tokens.first().ok_or("empty command")?.to_ascii_lowercase();

    match verb.as_str() {
        "help" => Ok(Command::Help),
        "esc" => Ok(Command::Exit),
        "proxy" => parse_proxy(&tokens),
        "bridge" => parse_bridge(&tokens),
        "source" => parse_source(&tokens),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_proxy(tokens: &[&str]) -> Result<Command, String> {
    let sub = tokens
        .get(1)
        .ok_or("usage: proxy rotate <id|all> | proxy amount <N>")?
        .to_ascii_lowercase();
    match sub.as_str() {
        "rotate" => {
            let target = tokens.get(2).ok_or("usage: proxy rotate <id|all>")?;
            if target.eq_ignore_ascii_case("all") {
                Ok(Command::ProxyRotate(RotateTarget::All))
            } else {
                let id = target
                    .parse::<usize>()
                    .map_err(|_| format!("invalid bridge id '{target}'"))?;
                Ok(Command::ProxyRotate(RotateTarget::Id(id)))
            }
        }
        "amount" => {
            let raw = tokens.get(2).ok_or("usage: proxy amount <N>")?;
            let n: usize = raw.parse().map_err(|_| format!("invalid amount '{raw}'"))?;
            if n < 1 {
                return Err("amount must be at least 1".to_string());
            }
            Ok(Command::ProxyAmount(n))
        }
        other => Err(format!("unknown proxy subcommand '{other}'")),
    }
}

fn parse_bridge(tokens: &[&str]) -> Result<Command, String> {
    let sub = tokens.get(1).ok_or("usage: bridge on|off|stats")?.to_ascii_lowercase();
    match sub.as_str() {
        "on" => {
            let raw_port = tokens.get(2).ok_or("usage: bridge on <port> [strategy]")?;
            let port: u16 = raw_port.parse().map_err(|_| format!("invalid port '{raw_port}'"))?;
            let strategy = match tokens.get(3) {
                Some(s) => s.parse::<Strategy>()?,
                None => Strategy::Random,
            };
            Ok(Command::BridgeOn { port, strategy })
        }
        "off" => Ok(Command::BridgeOff),
        "stats" => Ok(Command::BridgeStats),
        other => Err(format!("unknown bridge subcommand '{other}'")),
    }
}

fn parse_source(tokens: &[&str]) -> Result<Command, String> {
    let sub = tokens.get(1).ok_or("usage: source add|rem|list")?.to_ascii_lowercase();
    match sub.as_str() {
        "add" => {
            let url = tokens.get(2).ok_or("usage: source add <url>")?;
            Ok(Command::SourceAdd((*url).to_string()))
        }
        "rem" => {
            let raw = tokens.get(2).ok_or("usage: source rem <id>")?;
            let id: usize = raw.parse().map_err(|_| format!("invalid source id '{raw}'"))?;
            Ok(Command::SourceRem(id))
        }
        "list" => Ok(Command::SourceList),
        other => Err(format!("unknown source subcommand '{other}'")),
    }
}

pub enum Outcome {
    Message(String),
    Exit,
}

/// Drives the Bridge Manager and Load Balancer from parsed commands. Holds
/// the one balancer slot (at most one instance runs at a time) and the
/// registered sources.
pub struct CommandProcessor {
    bridges: Arc<BridgeManager>,
    balancer: Mutex<Option<Arc<LoadBalancer>>>,
    sources: Arc<Mutex<Sources>>,
}

impl CommandProcessor {
    /// `sources` is shared with the Source Loader (J): commands issued here
    /// are immediately visible to the next `rotate`/`resize` fallback reload.
    pub fn new(bridges: Arc<BridgeManager>, sources: Arc<Mutex<Sources>>) -> Self {
        Self {
            bridges,
            balancer: Mutex::new(None),
            sources,
        }
    }

    pub async fn dispatch(&self, line: &str) -> Outcome {
        match parse_command(line) {
            Ok(command) => self.execute(command).await,
            Err(err) => Outcome::Message(format!("Error: {err}")),
        }
    }

    async fn execute(&self, command: Command) -> Outcome {
        match command {
            Command::Help => Outcome::Message(HELP_TEXT.to_string()),
            Command::Exit => Outcome::Exit,
            Command::ProxyRotate(RotateTarget::Id(id)) => {
                Outcome::Message(self.bridges.rotate(id).await)
            }
            Command::ProxyRotate(RotateTarget::All) => {
                let messages = self.bridges.rotate_all().await;
                Outcome::Message(messages.join("\n"))
            }
            Command::ProxyAmount(n) => Outcome::Message(self.bridges.adjust_amount(n).await),
            Command::BridgeOn { port, strategy } => Outcome::Message(self.bridge_on(port, strategy).await),
            Command::BridgeOff => Outcome::Message(self.bridge_off().await),
            Command::BridgeStats => Outcome::Message(self.bridge_stats()),
            Command::SourceAdd(url) => {
                let id = self.sources.lock().add(SourceKind::Http(url.clone()));
                Outcome::Message(format!("Added source #{id}: {url}"))
            }
            Command::SourceRem(id) => match self.sources.lock().remove(id) {
                Some(_) => Outcome::Message(format!("Removed source #{id}")),
                None => Outcome::Message(format!("Error: no source with id {id}")),
            },
            Command::SourceList => Outcome::Message(self.source_list()),
        }
    }

    async fn bridge_on(&self, port: u16, strategy: Strategy) -> String {
        if self.balancer.lock().as_ref().is_some_and(|b| b.is_active()) {
            return "Load balancer already running".to_string();
        }
        let targets: Vec<BridgeTarget> = self
            .bridges
            .snapshot()
            .await
            .into_iter()
            .map(|b| BridgeTarget { id: b.id, port: b.port })
            .collect();

        let events = self.bridges_events();
        let balancer = LoadBalancer::new(targets, port, strategy, events);
        match balancer.start().await {
            Ok(()) => {
                *self.balancer.lock() = Some(balancer);
                format!("Load balancer started on port {port} ({strategy} strategy)")
            }
            Err(err) => format!("Error: failed to start load balancer: {err}"),
        }
    }

    async fn bridge_off(&self) -> String {
        let Some(balancer) = self.balancer.lock().take() else {
            return "Load balancer is not running".to_string();
        };
        let port = balancer.port();
        balancer.stop().await;
        format!("Load balancer stopped (was on port {port})")
    }

    fn bridge_stats(&self) -> String {
        match self.balancer.lock().as_ref() {
            Some(balancer) if balancer.is_active() => {
                let stats = balancer.stats();
                let mut lines = vec![format!(
                    "port={} strategy={} total={} active={}",
                    stats.port, stats.strategy, stats.total_connections, stats.active_connections
                )];
                let mut ids: Vec<&usize> = stats.bridge_stats.keys().collect();
                ids.sort();
                for id in ids {
                    let s = &stats.bridge_stats[id];
                    lines.push(format!("  bridge {id}: total={} active={}", s.total, s.active));
                }
                lines.join("\n")
            }
            _ => "Load balancer is not running".to_string(),
        }
    }

    fn source_list(&self) -> String {
        let sources = self.sources.lock();
        if sources.is_empty() {
            return "No sources registered".to_string();
        }
        sources
            .iter()
            .map(|(id, kind)| match kind {
                SourceKind::Http(url) => format!("#{id}: {url}"),
                SourceKind::File(path) => format!("#{id}: {}", path.display()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn bridges_events(&self) -> crate::core::event::EventSender {
        self.bridges.events_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_grammar() {
        assert_eq!(parse_command("help").unwrap(), Command::Help);
        assert_eq!(parse_command("ESC").unwrap(), Command::Exit);
        assert_eq!(
            parse_command("proxy rotate all").unwrap(),
            Command::ProxyRotate(RotateTarget::All)
        );
        assert_eq!(
            parse_command("PROXY ROTATE 3").unwrap(),
            Command::ProxyRotate(RotateTarget::Id(3))
        );
        assert_eq!(parse_command("proxy amount 5").unwrap(), Command::ProxyAmount(5));
        assert!(parse_command("proxy amount 0").is_err());
        assert_eq!(
            parse_command("bridge on 8080 round-robin").unwrap(),
            Command::BridgeOn { port: 8080, strategy: Strategy::RoundRobin }
        );
        assert_eq!(
            parse_command("bridge on 8080").unwrap(),
            Command::BridgeOn { port: 8080, strategy: Strategy::Random }
        );
        assert_eq!(parse_command("bridge off").unwrap(), Command::BridgeOff);
        assert_eq!(parse_command("bridge stats").unwrap(), Command::BridgeStats);
        assert_eq!(
            parse_command("source add http://example.com/sub").unwrap(),
            Command::SourceAdd("http://example.com/sub".to_string())
        );
        assert_eq!(parse_command("source rem 2").unwrap(), Command::SourceRem(2));
        assert_eq!(parse_command("source list").unwrap(), Command::SourceList);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("").is_err());
        assert!(parse_command("bogus").is_err());
        assert!(parse_command("proxy rotate").is_err());
        assert!(parse_command("bridge on notaport").is_err());
        assert!(parse_command("bridge on 8080 bogus-strategy").is_err());
    }
}
