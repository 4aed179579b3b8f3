//! `mender` binary entrypoint.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use mender_proxy::{serve, ProxyConfig};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => run(cli.command(), config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config =
        ProxyConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("configuration rejected")?;
    Ok(config)
}

async fn run(command: Commands, config: ProxyConfig) -> Result<()> {
    match command {
        Commands::Serve => run_serve(config).await,
        Commands::Check => run_check(&config).await,
        Commands::Config => run_config(&config),
    }
}

/// Console logging plus an optional non-blocking file writer. `RUST_LOG`
/// wins over the configured level. The returned guard flushes the file on
/// drop and must outlive the server.
fn init_logging(config: &ProxyConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("failed to initialize logging")?;

    Ok(guard)
}

fn print_banner(config: &ProxyConfig) {
    let local = probe_host(config);
    println!("{}", "mender compatibility proxy".cyan().bold());
    println!(
        "  {} http://{}:{}",
        "listening:".bold(),
        config.host,
        config.port
    );
    println!("  {} {}", "backend:  ".bold(), config.backend_url_trimmed());
    println!(
        "  {} http://{}:{}/health",
        "health:   ".bold(),
        local,
        config.port
    );
    if config.debug {
        println!("  {}", "debug logging enabled".yellow());
    }
    if let Some(path) = &config.log_file {
        println!("  {} {}", "log file: ".bold(), path.display());
    }
    println!();
}

async fn run_serve(config: ProxyConfig) -> Result<()> {
    let _guard = init_logging(&config)?;
    print_banner(&config);
    serve(config).await
}

/// Address to reach the proxy from this machine.
fn probe_host(config: &ProxyConfig) -> &str {
    match config.host.as_str() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        host => host,
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("no response from {}", url))?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("{} answered {}", url, status);
    }
    Ok(())
}

async fn run_check(config: &ProxyConfig) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(CHECK_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let targets = [
        (
            "proxy",
            format!("http://{}:{}/health", probe_host(config), config.port),
        ),
        (
            "backend",
            format!("{}/health", config.backend_url_trimmed()),
        ),
    ];

    let mut failed = 0;
    for (name, url) in &targets {
        match probe(&client, url).await {
            Ok(()) => println!("{} {:<8} {}", "OK".green().bold(), name, url.dimmed()),
            Err(e) => {
                failed += 1;
                println!("{} {:<8} {:#}", "FAILED".red().bold(), name, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} health checks failed", failed, targets.len());
    }
    Ok(())
}

fn run_config(config: &ProxyConfig) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(config).context("failed to render configuration")?;
    print!("{}", yaml);
    Ok(())
}
