//! Application entrypoint: CLI parsing, telemetry init, and dispatch into
//! `NyxProxyManager`. Exit codes: `0` success, `1` fatal error, `130` SIGINT.

use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use nyxproxy::cli::{Cli, Commands, ProbeArgs, StartArgs};
use nyxproxy::core::config::AppConfig;
use nyxproxy::core::event::StatusEvent;
use nyxproxy::manager::{NyxProxyManager, RunOptions};

fn probe_opts(args: &ProbeArgs) -> RunOptions {
    RunOptions {
        country: args.country.clone(),
        limit: args.limit,
        force: args.force,
        find_first: args.find_first,
        extra_sources: args.source.clone(),
        skip_geo: args.no_geo,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            return ExitCode::from(1);
        }
    };

    let (manager, events_rx) = NyxProxyManager::new(config);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv_async().await {
            log_event(event);
        }
    });

    tokio::select! {
        result = run(&manager, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted; tearing down bridges...");
            manager.stop().await;
            ExitCode::from(130)
        }
    }
}

fn log_event(event: StatusEvent) {
    match event {
        StatusEvent::Log { level, message } => match level {
            nyxproxy::core::event::LogLevel::Debug => tracing::debug!("{message}"),
            nyxproxy::core::event::LogLevel::Info => tracing::info!("{message}"),
            nyxproxy::core::event::LogLevel::Warn => tracing::warn!("{message}"),
            nyxproxy::core::event::LogLevel::Error => tracing::error!("{message}"),
        },
        other => tracing::debug!("{other:?}"),
    }
}

async fn run(manager: &NyxProxyManager, command: Commands) -> ExitCode {
    match command {
        Commands::Test(args) => {
            let results = manager.test(probe_opts(&args)).await;
            let ok = results.iter().filter(|r| r.status == nyxproxy::core::model::Status::Ok).count();
            println!("Tested {} candidates, {ok} OK", results.len());
            ExitCode::from(0)
        }
        Commands::Start(StartArgs { probe, amounts, balancer_port }) => {
            let live = match manager.start(amounts, probe_opts(&probe)).await {
                Ok(live) => live,
                Err(err) => {
                    eprintln!("Error: {err}");
                    return ExitCode::from(1);
                }
            };
            println!("{live} bridge(s) running.");

            let processor = manager.command_processor();
            if let Some(port) = balancer_port {
                match processor.dispatch(&format!("bridge on {port}")).await {
                    nyxproxy::control::Outcome::Message(msg) => print_outcome(&msg),
                    nyxproxy::control::Outcome::Exit => {}
                }
            }

            repl(&processor).await;
            manager.stop().await;
            ExitCode::from(0)
        }
        Commands::Chains { probe, amounts, cmd } => match manager.run_chains(amounts, probe_opts(&probe), cmd).await {
            Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
            Err(err) => {
                eprintln!("Error: {err}");
                ExitCode::from(1)
            }
        },
        Commands::Clear { age } => {
            let parsed = match nyxproxy::cache::parse_age_expr(age.as_deref().unwrap_or("")) {
                Ok(age) => age,
                Err(err) => {
                    eprintln!("Error: {err}");
                    return ExitCode::from(1);
                }
            };
            let pruned = manager.clear_cache(parsed);
            println!("Cleared {pruned} cache entries.");
            ExitCode::from(0)
        }
        Commands::ListProxies { output_json } => {
            let proxies = manager.list_proxies().await;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&proxies_json(&proxies)).unwrap());
            } else if proxies.is_empty() {
                println!("No bridges running.");
            } else {
                for p in &proxies {
                    println!("#{} {} [{}] port={} status={:?}", p.id, p.uri, p.tag, p.port, p.status);
                }
            }
            ExitCode::from(0)
        }
        Commands::Export { output_json } => {
            let proxies = manager.list_proxies().await;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&proxies_json(&proxies)).unwrap());
            } else {
                for p in &proxies {
                    println!("{}", p.uri);
                }
            }
            ExitCode::from(0)
        }
    }
}

fn proxies_json(proxies: &[nyxproxy::bridge::manager::BridgeInfo]) -> Vec<serde_json::Value> {
    proxies
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "uri": p.uri,
                "tag": p.tag,
                "port": p.port,
                "status": format!("{:?}", p.status),
            })
        })
        .collect()
}

fn print_outcome(message: &str) {
    println!("{message}");
}

/// Reads commands from stdin while bridges are running, until `ESC` or EOF.
async fn repl(processor: &nyxproxy::control::CommandProcessor) {
    println!("Type 'help' for commands, ESC to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match processor.dispatch(&line).await {
                    nyxproxy::control::Outcome::Message(msg) => print_outcome(&msg),
                    nyxproxy::control::Outcome::Exit => break,
                }
            }
            _ => break,
        }
    }
}

