//! canprobe - CAN transport probe for VoltageEMS
//!
//! Lists the registered transports, dumps traffic from a channel and sends
//! frames in candump syntax through any transport of the registry.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use voltage_canbus::{registry, Bus, BusConfig, Frame, ReceptionState};

#[derive(Parser)]
#[command(name = "canprobe")]
#[command(about = "CAN transport probe for VoltageEMS")]
#[command(long_about = "CAN transport probe for VoltageEMS

Examples:
  canprobe list                                  # Registered transports
  canprobe -c vcan0 dump --count 10              # Print 10 frames
  canprobe -t socketcan-ring -c can0 dump        # Dump through the mmap ring
  canprobe -c vcan0 send 123#DEADBEEF            # Send one frame
  canprobe -c vcan0 send 18FF0001#R8 --repeat 5  # Five extended RTR frames")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Transport name as registered
    #[arg(short, long, global = true, env = "CANPROBE_TRANSPORT", default_value = "socketcan")]
    transport: String,

    /// Channel (interface name for SocketCAN transports)
    #[arg(short, long, global = true, env = "CANPROBE_CHANNEL", default_value = "can0")]
    channel: String,

    /// Bus configuration file (YAML, TOML or JSON)
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered transport names
    List,

    /// Print the effective bus configuration
    Config,

    /// Print received frames until the count is reached or a signal arrives
    Dump {
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Print statistics as JSON on exit
        #[arg(long)]
        json: bool,
    },

    /// Send a frame given in candump syntax (e.g. 123#DEADBEEF, 123#R2)
    Send {
        frame: Frame,

        /// Number of times to send the frame
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,

        /// Pause between repeated sends
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    voltage_canbus::register_default_transports();
    let config = BusConfig::load(cli.config_path.as_deref()).context("Failed to load bus config")?;

    match cli.command {
        Commands::List => {
            for name in registry::global().names() {
                let marker = if name == cli.transport { "*" } else { " " };
                println!("{} {}", marker.green(), name);
            }
            Ok(())
        },
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        },
        Commands::Dump { count, json } => {
            let bus = open(&cli.transport, &cli.channel, &config)?;
            let result = dump(bus.as_ref(), count).await;
            bus.disconnect().await?;
            print_stats(bus.as_ref(), json)?;
            result
        },
        Commands::Send {
            frame,
            repeat,
            interval_ms,
        } => {
            let bus = open(&cli.transport, &cli.channel, &config)?;
            bus.connect().await?;
            let result = send(bus.as_ref(), &frame, repeat, Duration::from_millis(interval_ms)).await;
            bus.disconnect().await?;
            result
        },
    }
}

fn open(transport: &str, channel: &str, config: &BusConfig) -> Result<Box<dyn Bus>> {
    registry::create_with(transport, channel, config)
        .with_context(|| format!("Cannot open {transport} on {channel}"))
}

async fn dump(bus: &dyn Bus, count: Option<u64>) -> Result<()> {
    // The listener runs on the reception task; printing happens here
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    bus.subscribe(Box::new(move |frame: Frame| {
        let _ = tx.send(frame);
    }));
    let mut state = bus.reception_state();
    bus.connect().await?;
    info!("Listening on {} via {}", bus.channel(), bus.transport_type());

    let channel = bus.channel().to_string();
    let mut printed = 0u64;
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                println!("  {}  {}", channel.cyan(), frame);
                printed += 1;
                if count.is_some_and(|limit| printed >= limit) {
                    return Ok(());
                }
            },
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                if let ReceptionState::Failed(reason) = &*state.borrow() {
                    bail!("Reception stopped: {reason}");
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                return Ok(());
            },
        }
    }
}

async fn send(bus: &dyn Bus, frame: &Frame, repeat: u32, interval: Duration) -> Result<()> {
    for i in 0..repeat {
        bus.send(frame)
            .await
            .with_context(|| format!("Failed to send {frame}"))?;
        if i + 1 < repeat && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    println!(
        "{} {} x{} on {}",
        "sent".green(),
        frame,
        repeat,
        bus.channel()
    );
    Ok(())
}

fn print_stats(bus: &dyn Bus, json: bool) -> Result<()> {
    let stats = bus.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!();
    println!("{}", "Statistics".bold());
    println!("  received        {}", stats.frames_received);
    println!("  sent            {}", stats.frames_sent);
    if stats.frames_dropped > 0 {
        println!("  dropped         {}", stats.frames_dropped.to_string().yellow());
    } else {
        println!("  dropped         0");
    }
    if stats.receive_errors > 0 {
        println!("  receive errors  {}", stats.receive_errors.to_string().red());
    }
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => { sig.recv().await; },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send_command() {
        let cli = Cli::try_parse_from(["canprobe", "-c", "vcan0", "send", "123#DEADBEEF", "--repeat", "3"])
            .unwrap();
        assert_eq!(cli.channel, "vcan0");
        match cli.command {
            Commands::Send { frame, repeat, .. } => {
                assert_eq!(frame.id(), 0x123);
                assert_eq!(frame.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
                assert_eq!(repeat, 3);
            },
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_rejects_malformed_frame() {
        assert!(Cli::try_parse_from(["canprobe", "send", "123-DEADBEEF"]).is_err());
    }

    #[tokio::test]
    async fn test_send_and_dump_on_virtual_bus() {
        voltage_canbus::register_default_transports();
        let config = BusConfig::default();
        let rx = open("virtual", "canprobe-test", &config).unwrap();
        let tx = open("virtual", "canprobe-test", &config).unwrap();
        tx.connect().await.unwrap();

        let dumping = tokio::spawn(async move {
            dump(rx.as_ref(), Some(2)).await.unwrap();
            rx.disconnect().await.unwrap();
            rx.stats()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame: Frame = "321#0102".parse().unwrap();
        send(tx.as_ref(), &frame, 2, Duration::ZERO).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), dumping)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.frames_received, 2);
    }
}
