//! CLI commands

use clap::{Parser, Subcommand};
use mender_proxy::ProxyConfig;
use std::path::PathBuf;

/// Mender - compatibility proxy for OpenAI-compatible relays
#[derive(Parser, Debug)]
#[command(name = "mender")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "MENDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Backend base URL (e.g., http://localhost:4000)
    #[arg(short, long, global = true)]
    pub backend_url: Option<String>,

    /// Enable debug logging (logs request payloads)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Start the proxy (default)
    Serve,

    /// Check that the proxy and the backend answer their health endpoints
    Check,

    /// Print the effective configuration as YAML
    Config,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Serve)
    }

    /// Flags win over the file and environment layers.
    pub fn apply_overrides(&self, config: &mut ProxyConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = &self.backend_url {
            config.backend_url = url.clone();
        }
        if self.debug {
            config.debug = true;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
    }
}
