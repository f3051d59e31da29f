//! CLI surface: `test`, `start`, `chains`, `clear`, `list-proxies`, `export`.
//! Each subcommand is a thin wrapper over `NyxProxyManager` — the same
//! entry points the interactive control plane drives via `CommandProcessor`.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nyxproxy", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Health-checks candidate proxies and caches the results without starting bridges.
    Test(ProbeArgs),

    /// Health-checks, then launches bridges and a local load balancer for the best survivors.
    Start(StartArgs),

    /// Starts a fresh bridge batch, runs a command through it via proxychains, tears it down on exit.
    Chains {
        #[command(flatten)]
        probe: ProbeArgs,

        /// Number of bridges to use for the chain.
        #[arg(short = 'a', long, default_value_t = 5)]
        amounts: usize,

        /// Command (and its arguments) to execute through the chain.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },

    /// Clears cached health-check results.
    Clear {
        /// Age expression (e.g. `5H`, `1D,12H`); omit to clear everything.
        #[arg(long)]
        age: Option<String>,
    },

    /// Lists currently running bridges.
    ListProxies {
        #[arg(short = 'j', long = "output-json")]
        output_json: bool,
    },

    /// Dumps the current cache as a flat list.
    Export {
        #[arg(short = 'j', long = "output-json")]
        output_json: bool,
    },
}

/// Flags shared by `test`/`start`/`chains` — anything that shapes a
/// health-check pass.
#[derive(clap::Args, Clone)]
pub struct ProbeArgs {
    /// Restrict results to a single country (ISO label or name).
    #[arg(short = 'c', long)]
    pub country: Option<String>,

    /// Health-check concurrency.
    #[arg(short = 't', long, default_value_t = 20)]
    pub threads: usize,

    /// Caps how many candidates are loaded; `0` means unlimited.
    #[arg(short = 'l', long, default_value_t = 0)]
    pub limit: usize,

    /// Re-tests everything, ignoring cached results.
    #[arg(long)]
    pub force: bool,

    /// Skips geo enrichment.
    #[arg(long = "no-geo")]
    pub no_geo: bool,

    /// Stops Phase 2 as soon as this many `OK` results are found.
    #[arg(long = "find-first", visible_alias = "ff")]
    pub find_first: Option<usize>,

    /// One-off URL or file source, in addition to any registered sources.
    #[arg(short = 's', long = "source")]
    pub source: Vec<String>,
}

#[derive(clap::Args, Clone)]
pub struct StartArgs {
    #[command(flatten)]
    pub probe: ProbeArgs,

    /// Number of bridges to keep running.
    #[arg(short = 'a', long, default_value_t = 5)]
    pub amounts: usize,

    /// Also starts the local load balancer on this port.
    #[arg(long)]
    pub balancer_port: Option<u16>,
}
