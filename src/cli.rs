//! Command-line interface

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;
use crate::permissions::Capability;

/// Single-port TLS gateway for node RPC services
#[derive(Parser, Debug)]
#[command(name = "lightgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "LIGHTGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides `server.listen`)
    #[arg(short, long, env = "LIGHTGATE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "LIGHTGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LIGHTGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Bake a macaroon scoped to one backend
    Bake {
        /// Backend id (e.g. `node`, `swap`)
        #[arg(required = true)]
        backend: String,

        /// Capabilities as `entity:action`; defaults to everything the
        /// backend offers
        #[arg(short = 'p', long = "permission", value_delimiter = ',')]
        capabilities: Vec<Capability>,

        #[command(flatten)]
        constraints: ConstraintArgs,
    },

    /// Bake a gateway-level macaroon valid for every backend
    BakeSuper {
        /// Only include read capabilities
        #[arg(long)]
        read_only: bool,

        #[command(flatten)]
        constraints: ConstraintArgs,
    },

    /// Replace a root key, revoking every macaroon it signed
    RotateKey {
        /// Root key id (a backend id, or `super`)
        #[arg(required = true)]
        root: String,
    },

    /// Ensure the TLS identity exists and print it
    Cert {
        /// Replace the existing certificate and key
        #[arg(long)]
        regenerate: bool,
    },

    /// Print the endpoint permission table
    Endpoints {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// Caveats to bake into a new macaroon.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConstraintArgs {
    /// Lifetime (e.g. `30m`, `24h`, `7d`); falls back to
    /// `macaroons.default_expiry`
    #[arg(long, value_parser = humantime_serde::parse)]
    pub expiry: Option<Duration>,

    /// Only valid when presented from this client address
    #[arg(long)]
    pub ip: Option<IpAddr>,
}
