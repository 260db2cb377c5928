//! daemon-link command line
//!
//! Sends one command to the daemon and prints the response.
//!
//! ## Usage
//!
//! ```bash
//! # Ask the daemon itself
//! daemon-link ping --destination daemon
//!
//! # Use a config file with routes and TLS credentials
//! daemon-link --config ~/.daemon-link/config.toml get_status
//!
//! # Pass a payload
//! daemon-link get_balance --data '{"wallet_id": 1}'
//!
//! # Stay connected and log every event
//! daemon-link --watch
//! ```

use anyhow::Context;
use clap::Parser;
use daemon_link::{Config, DaemonClient, Event, Request, StaticRouter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "daemon-link")]
#[command(about = "Send commands to the daemon over its WebSocket")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "DAEMON_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Daemon WebSocket URL
    #[arg(long, env = "DAEMON_LINK_URL")]
    url: Option<String>,

    /// Service name to register as
    #[arg(long)]
    origin: Option<String>,

    /// Extra route, as COMMAND=SERVICE (repeatable)
    #[arg(long = "route", value_parser = parse_route)]
    routes: Vec<(String, String)>,

    /// Request timeout in milliseconds (non-positive waits forever)
    #[arg(long, allow_hyphen_values = true)]
    timeout_ms: Option<i64>,

    /// Destination service, bypassing the route table
    #[arg(long)]
    destination: Option<String>,

    /// JSON payload
    #[arg(long)]
    data: Option<String>,

    /// Log client events until interrupted
    #[arg(long)]
    watch: bool,

    /// Command to send
    command: Option<String>,
}

fn parse_route(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(command, service)| (command.to_string(), service.to_string()))
        .ok_or_else(|| format!("expected COMMAND=SERVICE, got {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("daemon_link=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(origin) = args.origin {
        config.origin = origin;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    config.routes.extend(args.routes);

    let router: StaticRouter = config.routes.clone().into_iter().collect();
    let client = DaemonClient::from_config(&config, Arc::new(router))?;
    info!(url = %config.url, origin = %config.origin, "daemon-link starting");

    if args.watch {
        let mut events = client.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::Open => info!("connection open"),
                    Event::Close(cause) => warn!(cause = %cause, "connection closed"),
                    Event::ConnectError(cause) => warn!(cause = %cause, "connect failed"),
                    Event::Heartbeat => info!("heartbeat"),
                    Event::Spam { kind, message } => {
                        info!(kind = ?kind, command = %message.command, "unsolicited message")
                    }
                    Event::Debug(text) => info!(text = %text, "debug"),
                }
            }
        });
    }

    if let Some(command) = args.command {
        let mut request = Request::new(command);
        if let Some(destination) = args.destination {
            request = request.with_destination(destination);
        }
        if let Some(data) = args.data {
            let data = serde_json::from_str(&data).context("--data is not valid JSON")?;
            request = request.with_data(data);
        }

        let outcome = client.call(request).await;
        match outcome {
            Ok(response) => {
                let rendered = serde_json::to_string_pretty(&response.data)?;
                println!("{rendered}");
            }
            Err(e) => {
                if let Some(response) = e.response() {
                    error!(response = ?response.data, "Daemon rejected the request");
                }
                client.close().await;
                return Err(e.into());
            }
        }
    }

    if args.watch {
        tokio::signal::ctrl_c().await?;
    }

    client.close().await;
    Ok(())
}
