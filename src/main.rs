//! RelayNet - hub-and-spoke packet relay
//!
//! Runs a hub that peers authenticate against, or a peer that joins a hub
//! and routes documents to other peers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relaynet::config::{self, Config};
use relaynet::context::ProtocolContext;
use relaynet::network::{Hub, HubEvent, Peer, PeerEvent};
use relaynet::protocol::{
    handler_factory, DocumentPacket, Frame, HandlerContext, Identity, Packet, DEFAULT_PORT,
    PROTOCOL_VERSION,
};

/// RelayNet - route packets between peers through a hub
#[derive(Parser)]
#[command(name = "relaynet")]
#[command(author = "RelayNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Hub-and-spoke binary packet relay", long_about = None)]
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

#[derive(Subcommand)]
enum Commands {
    /// Run a hub
    Hub {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve TLS with a self-signed certificate
        #[arg(long)]
        tls: bool,
    },

    /// Join a hub as a peer
    Peer {
        /// Hub host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Hub port
        #[arg(short, long)]
        port: Option<u16>,

        /// Identity namespace (defaults to the configured one)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Connect over TLS, trusting any certificate
        #[arg(long)]
        tls: bool,

        /// Namespace of a member to send a document to
        #[arg(long, requires = "text")]
        route_to: Option<String>,

        /// Text to send with --route-to
        #[arg(long)]
        text: Option<String>,
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

    /// Show protocol information
    Info,
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
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Hub { host, port, tls } => {
            run_hub(config, host, port, tls).await?;
        }
        Commands::Peer {
            host,
            port,
            namespace,
            tls,
            route_to,
            text,
        } => {
            let target = route_to.zip(text);
            run_peer(config, host, port, namespace, tls, target).await?;
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
        Commands::Info => {
            println!("RelayNet Protocol Information");
            println!("=============================\n");
            println!("Protocol Version: {}", PROTOCOL_VERSION);
            println!("Default Port: {}", DEFAULT_PORT);
        }
    }

    Ok(())
}

/// Build a context with the configured admissions applied
fn build_context(config: &Config) -> ProtocolContext {
    let context = ProtocolContext::new(config.protocol.timings());
    for tag in config.protocol.admitted_tags() {
        context.allow_packet(tag);
    }
    context
}

/// Print every document that reaches this endpoint
fn print_documents(context: &ProtocolContext) {
    context.accept::<DocumentPacket>();
    context.register_handler(
        DocumentPacket::TAG,
        handler_factory(|| {
            |frame: &Frame, ctx: &HandlerContext| {
                if let Some(doc) = frame.packet::<DocumentPacket>() {
                    match &ctx.sender {
                        Some(sender) => println!("< {}: {}", sender, doc.document),
                        None => println!("< {}", doc.document),
                    }
                }
            }
        }),
    );
}

/// Run the hub
async fn run_hub(
    config: Config,
    host: Option<String>,
    port: Option<u16>,
    tls: bool,
) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    if let Some(host) = host {
        net_config.host = host;
    }
    if let Some(port) = port {
        net_config.port = port;
    }
    net_config.use_tls |= tls;

    let context = build_context(&config);
    print_documents(&context);

    let mut hub = Hub::with_context(net_config, context.into());
    let mut event_rx = hub
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("hub event receiver already taken"))?;

    let bind_addr = hub.start().await?;

    println!("\n========================================");
    println!("  RelayNet Hub Running");
    println!("========================================");
    println!("  Address: {}", bind_addr);
    println!("========================================");
    println!("\nWaiting for peers to connect...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    HubEvent::PeerAuthenticated { addr, identity } => {
                        println!("+ {} ({})", identity, addr);
                    }
                    HubEvent::PeerDisconnected { addr, identity: Some(identity), reason } => {
                        println!("- {} ({}): {}", identity, addr, reason);
                    }
                    HubEvent::PeerDisconnected { addr, identity: None, reason } => {
                        tracing::debug!("Unauthenticated {} left: {}", addr, reason);
                    }
                    HubEvent::Started { .. } | HubEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    hub.stop().await?;
    tracing::info!("Hub stopped");

    Ok(())
}

/// Run a peer
async fn run_peer(
    config: Config,
    host: String,
    port: Option<u16>,
    namespace: Option<String>,
    tls: bool,
    target: Option<(String, String)>,
) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    net_config.host = host.clone();
    net_config.use_tls |= tls;
    let port = port.unwrap_or(net_config.port);

    let mut identity = config.identity();
    if let Some(namespace) = namespace {
        identity = Identity::new(namespace, identity.id);
    }

    let context = build_context(&config);
    print_documents(&context);

    let mut peer = Peer::with_context(net_config, identity, context.into());
    let mut event_rx = peer
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("peer event receiver already taken"))?;

    println!("Connecting to {}:{}...", host, port);
    peer.connect_hostname(&host, port).await?;
    peer.stay_active();

    println!("\n========================================");
    println!("  RelayNet Peer Connected");
    println!("========================================");
    println!("  Identity: {}", peer.identity());
    println!("  Members: {}", peer.members().len());
    println!("========================================");
    println!("\nPress Ctrl+C to disconnect.\n");

    if let Some((namespace, text)) = target {
        send_when_present(&peer, &namespace, &text).await;
    }

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    PeerEvent::Connected { hub_addr, members } => {
                        tracing::info!("Connected to {} with {} members", hub_addr, members.len());
                    }
                    PeerEvent::MemberJoined { identity } => println!("+ {}", identity),
                    PeerEvent::MemberLeft { identity } => println!("- {}", identity),
                    PeerEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    peer.disconnect().await?;
    tracing::info!("Peer disconnected");

    Ok(())
}

/// Wait briefly for a member with `namespace`, then route `text` to it
async fn send_when_present(peer: &Peer, namespace: &str, text: &str) {
    let mut member = peer.find_member(namespace);
    for _ in 0..50 {
        if member.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        member = peer.find_member(namespace);
    }

    let Some(member) = member else {
        println!("No member named '{}'", namespace);
        return;
    };

    let document = DocumentPacket::new(serde_json::json!({ "text": text }));
    let outcome = peer.route(&member, &document).await;
    println!("> {}: {:?}", member, outcome);
}
