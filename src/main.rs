//! fieldmux entry point: parses a subcommand, sets up layered logging (rolling daily file layer
//! plus an optional colorized stdout layer), then either runs the plan-execution server loop or
//! drives a single demonstration client.

use anyhow::{Context, Result};
use clap::Parser;
use fieldmux::config::Config;
use fieldmux::dispatcher::{run_server, Dispatcher};
use fieldmux::domain::DomainMapRegistry;
use fieldmux::metadata::Metadata;
use fieldmux::peer::Peer;
use fieldmux::transport::{Transport, TransportFactory};
use fieldmux::FieldmuxClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod cli;
mod logging;

use cli::{Args, Command};
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    match args.command {
        Command::Serve {
            config,
            host,
            port,
            server_index,
        } => serve(config, host, port, server_index).await,
        Command::ClientDemo {
            config,
            host,
            port,
            client_id,
        } => client_demo(config, host, port, client_id).await,
    }
}

/// Sets up a detailed file (or stderr) layer plus an optional colorized stdout layer. The
/// returned guard must stay alive for the process lifetime or the non-blocking file writer stops
/// flushing.
fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("fieldmux.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "fieldmux.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    Ok(guard)
}

async fn serve(config_path: PathBuf, host: String, port: u16, server_index: usize) -> Result<()> {
    let config = read_config(&config_path)?;

    let server_peers: Vec<Peer> = (0..config.server_count())
        .map(|i| Peer::new("server", i as u64))
        .collect();
    let local_peer = server_peers.get(server_index).cloned().with_context(|| {
        format!(
            "server index {server_index} out of range for {} configured server(s)",
            server_peers.len()
        )
    })?;

    let transport: Arc<dyn Transport> = Arc::from(
        TransportFactory::create(
            config.transport,
            local_peer.clone(),
            server_peers,
            config.count,
            &host,
            port,
        )
        .await?,
    );

    let domain_maps = Arc::new(DomainMapRegistry::new());
    let dispatcher = Dispatcher::from_config(&config, domain_maps.clone())?;

    info!("fieldmux server {local_peer} listening on {host}:{port}");
    run_server(transport, dispatcher, domain_maps, config.count).await
}

async fn client_demo(config_path: PathBuf, host: String, port: u16, client_id: u64) -> Result<()> {
    let config = read_config(&config_path)?;

    let client = FieldmuxClient::new(&config, &host, port, client_id).await?;
    client.open().await?;
    client
        .write_domain("grid", 8, (0..8).collect(), 1)
        .await?;

    let mut metadata = Metadata::new();
    metadata.set("category", "ocean");
    metadata.set("name", "sst");
    metadata.set("level", 1_i64);
    metadata.set("domain", "grid");
    metadata.set("level_count", 1_i64);

    let field: Vec<f64> = (0..8).map(|i| i as f64).collect();
    client.write_field(metadata.clone(), &field).await?;
    client.flush(metadata).await?;
    client.close().await?;

    info!("client {client_id} wrote one field and closed");
    Ok(())
}

fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    Ok(match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Config::from_json(&text)?,
        _ => Config::from_yaml(&text)?,
    })
}
