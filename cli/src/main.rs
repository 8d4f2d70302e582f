// ocfble: desktop CLI for the BLE GATT transport
//
// Scans for devices hosting the transport service and exchanges raw payloads
// with them through the client role, using the local adapter via btleplug.

mod btle;
mod config;

use anyhow::{Context, Result};
use btle::BtlePlatform;
use clap::{Parser, Subcommand};
use colored::*;
use ocfble_core::{
    AdapterControl, BleError, GattClientPlatform, LeEventListener, LePlatforms, LeTransport,
    ScanResult,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "ocfble")]
#[command(about = "OCF payloads over BLE GATT", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Write one payload to a device, connecting on demand
    Send {
        address: String,
        payload: String,
        /// Payload is hex encoded
        #[arg(long)]
        hex: bool,
        /// Seconds to keep listening for responses
        #[arg(short, long)]
        wait: Option<u64>,
    },
    /// Write one payload to every device found advertising the service
    Multicast {
        payload: String,
        #[arg(long)]
        hex: bool,
        #[arg(short, long)]
        wait: Option<u64>,
    },
    /// Show adapter and transport status
    Status,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Scan { seconds } => cmd_scan(seconds).await,
        Commands::Send {
            address,
            payload,
            hex,
            wait,
        } => cmd_send(address, parse_payload(&payload, hex)?, wait).await,
        Commands::Multicast { payload, hex, wait } => {
            cmd_multicast(parse_payload(&payload, hex)?, wait).await
        }
        Commands::Status => cmd_status().await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn parse_payload(payload: &str, hex_input: bool) -> Result<Vec<u8>> {
    let bytes = if hex_input {
        let compact: String = payload.split_whitespace().collect();
        hex::decode(compact).context("Invalid hex payload")?
    } else {
        payload.as_bytes().to_vec()
    };
    if bytes.is_empty() {
        anyhow::bail!("Payload is empty");
    }
    Ok(bytes)
}

fn render(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) if !text.chars().any(|c| c.is_control()) => format!("\"{}\"", text),
        _ => hex::encode(data),
    }
}

/// Prints inbound traffic as it arrives
struct ConsoleListener;

impl LeEventListener for ConsoleListener {
    fn on_data_received(&self, address: &str, data: &[u8]) {
        println!(
            "  {} {} {} ({} bytes)",
            "←".bright_green(),
            address.bright_cyan(),
            render(data),
            data.len()
        );
    }

    fn on_send_error(&self, address: &str, data: &[u8], error: &BleError) {
        println!(
            "  {} {} {} bytes not delivered: {}",
            "✗".red(),
            address.bright_cyan(),
            data.len(),
            error
        );
    }

    fn on_adapter_state_changed(&self, enabled: bool) {
        let state = if enabled { "on".green() } else { "off".red() };
        println!("  Bluetooth adapter switched {}", state);
    }
}

async fn open_transport(config: &config::Config) -> Result<(Arc<BtlePlatform>, LeTransport)> {
    let platform = BtlePlatform::open()
        .await
        .context("Failed to open Bluetooth adapter")?;
    let transport = LeTransport::new(
        config.adapter.clone(),
        LePlatforms::client_only(platform.clone()),
    )
    .context("Desktop binding supports the client role only")?;
    transport.set_listener(Arc::new(ConsoleListener));
    transport.set_connection_state_changed_handler(Arc::new(|address: &str, up: bool| {
        let marker = if up { "connected".green() } else { "disconnected".yellow() };
        println!("  {} {}", address.bright_cyan(), marker);
    }));
    transport
        .start()
        .await
        .context("Failed to start BLE transport")?;
    Ok((platform, transport))
}

async fn shut_down(platform: Arc<BtlePlatform>, transport: LeTransport) {
    transport.stop().await;
    platform.close();
}

async fn cmd_scan(seconds: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let duration = Duration::from_secs(seconds.unwrap_or(config.scan_secs));
    let platform = BtlePlatform::open()
        .await
        .context("Failed to open Bluetooth adapter")?;

    println!(
        "{} ({}s)",
        "Scanning for BLE devices...".bold(),
        duration.as_secs()
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<ScanResult>();
    platform
        .scan_start(Box::new(move |result| {
            let _ = tx.send(result);
        }))
        .await
        .context("Failed to start scan")?;

    let service = config.adapter.service_uuid;
    let mut seen = HashSet::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(result) = rx.recv() => {
                if !seen.insert(result.address.clone()) {
                    continue;
                }
                let name = result.local_name.clone().unwrap_or_else(|| "(unnamed)".to_string());
                let rssi = result
                    .rssi
                    .map(|rssi| format!("{} dBm", rssi))
                    .unwrap_or_else(|| "-".to_string());
                let marker = if result.advertises(&service) {
                    "●".bright_green()
                } else {
                    "○".dimmed()
                };
                println!(
                    "  {} {}  {}  {}",
                    marker,
                    result.address.bright_cyan(),
                    name,
                    rssi.dimmed()
                );
            }
        }
    }

    if let Err(e) = platform.scan_stop().await {
        tracing::warn!("Failed to stop scan: {}", e);
    }
    platform.close();

    println!();
    println!("{} device(s) found; {} marks the transport service", seen.len(), "●".bright_green());
    Ok(())
}

async fn cmd_send(address: String, payload: Vec<u8>, wait: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let (platform, transport) = open_transport(&config).await?;

    println!("{} {}", "Sending to".bold(), address.bright_cyan());
    let result = transport.send_unicast(&address, &payload).await;
    match &result {
        Ok(()) => {
            println!("  {} {} bytes written", "✓".green(), payload.len());
            let wait = Duration::from_secs(wait.unwrap_or(config.response_wait_secs));
            tokio::time::sleep(wait).await;
        }
        Err(e) => println!("  {} {}", "✗".red(), e),
    }

    shut_down(platform, transport).await;
    result.context("Unicast failed")
}

async fn cmd_multicast(payload: Vec<u8>, wait: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let (platform, transport) = open_transport(&config).await?;

    println!("{}", "Multicasting...".bold());
    let result = transport.send_multicast(&payload).await;
    if result.is_ok() {
        // Peers found while the scan cycle runs get the payload too
        let listen = config.adapter.scan_timeout()
            + Duration::from_secs(wait.unwrap_or(config.response_wait_secs));
        println!(
            "  {} queued {} bytes; listening for {}s",
            "✓".green(),
            payload.len(),
            listen.as_secs()
        );
        tokio::time::sleep(listen).await;
        if let Some(client) = transport.client() {
            println!("  Reached {} device(s)", client.session_count());
        }
    }

    shut_down(platform, transport).await;
    result.context("Multicast failed")
}

async fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;
    let platform = BtlePlatform::open()
        .await
        .context("Failed to open Bluetooth adapter")?;

    let enabled = platform.is_enabled().await.unwrap_or(false);
    let adapter = platform
        .local_address()
        .await
        .unwrap_or_else(|e| format!("unknown ({})", e));
    platform.close();

    println!("{}", "Bluetooth".bold());
    println!("  Adapter:  {}", adapter.bright_cyan());
    println!(
        "  Enabled:  {}",
        if enabled { "yes".green() } else { "no".red() }
    );
    println!();
    println!("{}", "Transport".bold());
    println!("  Role:     {}", config.adapter.role);
    println!("  Service:  {}", config.adapter.service_uuid.to_string().bright_yellow());
    println!("  Config:   {}", config::Config::config_file()?.display());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:30} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload("hi", false).unwrap(), b"hi".to_vec());
        assert_eq!(
            parse_payload("01 02 ff", true).unwrap(),
            vec![0x01, 0x02, 0xff]
        );
        assert!(parse_payload("0g", true).is_err());
        assert!(parse_payload("", false).is_err());
    }

    #[test]
    fn test_render_prefers_text() {
        assert_eq!(render(b"ok"), "\"ok\"");
        assert_eq!(render(&[0x00, 0xa0]), "00a0");
    }
}
