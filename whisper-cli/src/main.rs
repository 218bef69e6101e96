//! Whisper CLI
//!
//! Runs the tunnel daemon and talks to it over the control socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use whisper_engine::{Config, ControlClient, ControlServer, SessionManager, StopReason};

/// Whisper - route device traffic through a remote tunnel endpoint
#[derive(Parser)]
#[command(name = "whisper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "whisper.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel daemon
    Run {
        /// Connect as soon as the daemon is up
        #[arg(long)]
        connect: bool,

        /// Remote tunnel endpoint (overrides the config file)
        #[arg(long)]
        url: Option<String>,

        /// DNS-over-HTTPS resolver (overrides the config file)
        #[arg(long)]
        doh: Option<String>,
    },

    /// Ask the daemon to start a session
    Connect {
        /// Remote tunnel endpoint
        #[arg(long)]
        url: Option<String>,

        /// DNS-over-HTTPS resolver
        #[arg(long)]
        doh: Option<String>,
    },

    /// Ask the daemon to stop the session
    Disconnect,

    /// Show session status
    Status,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "whisper.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenConfig { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"));
        return generate_config(output);
    }

    let config = load_config(&cli.config)?;
    init_logging(
        cli.log_level
            .as_deref()
            .unwrap_or(&config.common.log_level),
    );

    match cli.command {
        Commands::Run { connect, url, doh } => run_daemon(config, connect, url, doh).await,
        Commands::Connect { url, doh } => connect(&config, url, doh).await,
        Commands::Disconnect => disconnect(&config).await,
        Commands::Status => show_status(&config).await,
        Commands::GenConfig { .. } => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

async fn run_daemon(
    config: Config,
    connect: bool,
    url: Option<String>,
    doh: Option<String>,
) -> Result<()> {
    info!("Starting whisper daemon...");

    let mut defaults = config.session.clone();
    if let Some(url) = url {
        defaults.remote_url = url;
    }
    if let Some(doh) = doh {
        defaults.resolver_url = doh;
    }

    let session = Arc::new(SessionManager::from_config(&config));
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let mut signals = Signals::new().context("Failed to register signal handlers")?;

    let server = ControlServer::new(
        config.common.socket_path(),
        session.clone(),
        defaults.clone(),
        shutdown_tx,
    );
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("Control socket error: {}", e);
        }
    });

    if connect {
        if let Err(e) = session
            .connect(&defaults.remote_url, &defaults.resolver_url)
            .await
        {
            error!("Initial connect failed: {}", e);
        }
    }

    tokio::select! {
        _ = signals.recv() => {}
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested over the control socket");
        }
    }

    info!("Shutting down...");

    let teardown = session.disconnect_with(StopReason::ProcessExit);
    tokio::pin!(teardown);

    let finished = tokio::select! {
        result = &mut teardown => Some(result),
        _ = signals.recv() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            warn!("Second signal received; interrupting teardown");
            session.interrupt_teardown();
            teardown.await
        }
    };

    if let Err(e) = result {
        warn!("Teardown did not complete: {}", e);
    }

    server_handle.abort();
    let _ = server_handle.await;

    info!("Stopped");
    Ok(())
}

async fn connect(config: &Config, url: Option<String>, doh: Option<String>) -> Result<()> {
    let client = ControlClient::new(config.common.socket_path());
    client.connect(url, doh).await.context("Connect failed")?;

    println!("Connected");
    show_status(config).await
}

async fn disconnect(config: &Config) -> Result<()> {
    let client = ControlClient::new(config.common.socket_path());
    client.disconnect().await.context("Disconnect failed")?;

    println!("Disconnected");
    Ok(())
}

async fn show_status(config: &Config) -> Result<()> {
    let client = ControlClient::new(config.common.socket_path());
    let status = client.status().await.context("Failed to query status")?;

    println!("State:      {}", status.state);
    if let Some(url) = &status.remote_url {
        println!("Remote:     {}", url);
    }
    if let Some(url) = &status.resolver_url {
        println!("Resolver:   {}", url);
    }
    if let Some(port) = status.proxy_port {
        println!("Proxy:      socks5://127.0.0.1:{}", port);
    }
    if let Some(name) = &status.tun_name {
        println!("Interface:  {}", name);
    }
    if status.uptime_secs > 0 {
        println!("Uptime:     {}s", status.uptime_secs);
    }
    if let Some(err) = &status.last_error {
        println!("Last error: {}", err);
    }

    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    std::fs::write(output, Config::sample())
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nSet [session] remote_url, or pass --url to `whisper run`.");

    Ok(())
}

/// Termination signals the daemon reacts to
struct Signals {
    term: Signal,
    int: Signal,
}

impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.term.recv() => info!("Received SIGTERM"),
            _ = self.int.recv() => info!("Received SIGINT"),
        }
    }
}
