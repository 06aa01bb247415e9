//! xapnet - xAP home automation messaging
//!
//! Command line tool for watching xAP traffic and sending messages.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use xapnet::config::{self, Config, ConnectionOptions, ProtocolVersion, SourceAddress};
use xapnet::network::{Connection, ConnectionEvent, ConnectionState};
use xapnet::protocol::{self, Block, Routing};

/// xapnet - xAP home automation messaging
#[derive(Parser)]
#[command(name = "xapnet")]
#[command(author = "xapnet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Watch and send xAP home automation messages", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the configured source address
#[derive(clap::Args, Clone, Default)]
struct SourceArgs {
    /// Vendor part of our source address
    #[arg(long)]
    vendor: Option<String>,

    /// Device part of our source address
    #[arg(long)]
    device: Option<String>,

    /// Instance part of our source address (defaults to the host name)
    #[arg(long)]
    instance: Option<String>,

    /// Only listen to our own traffic on an ephemeral port
    #[arg(long)]
    loopback: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log everything received until Ctrl+C
    Listen {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Connect, send one message and disconnect
    Send {
        #[command(flatten)]
        source: SourceArgs,

        /// Message class, e.g. xap-x10.request
        #[arg(long)]
        class: String,

        /// Name of the payload block
        #[arg(long)]
        block: String,

        /// Payload items as key=value
        #[arg(short, long = "item", value_parser = parse_item)]
        items: Vec<(String, String)>,

        /// Target address
        #[arg(short, long)]
        target: Option<String>,

        /// Seconds to wait for our own heartbeat before sending anyway
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// Print the uid generated for a source address
    Uid {
        /// Source address, e.g. acme.lamp.kitchen
        source: String,

        /// Use the short v1.2 uid style
        #[arg(long)]
        v12: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_item(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Listen { source } => {
            let options = apply_source_args(config.connection, &source);
            run_listen(options).await?;
        }
        Commands::Send {
            source,
            class,
            block,
            items,
            target,
            wait,
        } => {
            let options = apply_source_args(config.connection, &source);
            let block = Block::new(block, items)?;
            let routing = Routing {
                target,
                ..Default::default()
            };
            run_send(options, &class, block, &routing, Duration::from_secs(wait)).await?;
        }
        Commands::Uid { source, v12 } => {
            let version = if v12 { ProtocolVersion::V12 } else { ProtocolVersion::V13 };
            println!("{}", protocol::generate_id(version, &source));
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn apply_source_args(mut options: ConnectionOptions, args: &SourceArgs) -> ConnectionOptions {
    let defaults = SourceAddress::default();
    if let Some(vendor) = &args.vendor {
        options.source.vendor = vendor.clone();
    }
    if let Some(device) = &args.device {
        options.source.device = device.clone();
    }
    if let Some(instance) = &args.instance {
        options.source.instance = instance.clone();
    } else if options.source.instance == defaults.instance {
        if let Ok(host) = hostname::get() {
            options.source.instance = host.to_string_lossy().to_lowercase();
        }
    }
    options.loopback |= args.loopback;
    options
}

/// Connect and print events until Ctrl+C
async fn run_listen(options: ConnectionOptions) -> anyhow::Result<()> {
    let mut conn = Connection::new(options.resolve()?);
    let mut event_rx = conn
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    conn.connect().await?;
    println!(
        "Listening as {} (uid {}) - press Ctrl+C to stop.",
        conn.config().source_string(),
        conn.config().uid
    );

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ConnectionEvent::Connected => println!("* connected"),
                    ConnectionEvent::LostConnection => println!("! connection lost"),
                    ConnectionEvent::Disconnected => break,
                    ConnectionEvent::Heartbeat { heartbeat, from } => {
                        println!("~ {} from {} ({})", heartbeat.class, heartbeat.source, from);
                    }
                    ConnectionEvent::Message { message, from } => {
                        println!("> {} from {} ({})", message.class(), message.source(), from);
                        for block in message.payload() {
                            print!("{}", block);
                        }
                    }
                    ConnectionEvent::Error { from, reason, .. } => {
                        tracing::warn!("Bad datagram from {:?}: {}", from, reason);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    if conn.is_connected() {
        conn.disconnect().await?;
    }
    Ok(())
}

/// Connect, wait briefly to hear ourselves, send one message
async fn run_send(
    options: ConnectionOptions,
    class: &str,
    block: Block,
    routing: &Routing,
    wait: Duration,
) -> anyhow::Result<()> {
    let mut conn = Connection::new(options.resolve()?);
    conn.connect().await?;

    let mut state = conn.watch_state();
    let alive = matches!(
        tokio::time::timeout(wait, state.wait_for(|s| *s == ConnectionState::Alive)).await,
        Ok(Ok(_))
    );
    if !alive {
        tracing::warn!("Own heartbeat not heard within {:?}, sending anyway", wait);
    }

    conn.send_block(class, block, routing).await?;
    println!("Sent {} from {}", class, conn.config().source_string());

    conn.disconnect().await?;
    Ok(())
}
