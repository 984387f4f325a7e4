//! PeerChat - Peer-to-peer terminal chat
//!
//! Runs either a rendezvous server or an interactive chat node.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerchat::config::{self, Config};
use peerchat::peer::{ChatEvent, Node};
use peerchat::rendezvous::RendezvousServer;

/// PeerChat - Peer-to-peer chat with rendezvous discovery
#[derive(Parser)]
#[command(name = "peerchat")]
#[command(author = "PeerChat Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Chat directly with peers found through a rendezvous server", long_about = None)]
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
    /// Run a rendezvous server
    Rendezvous {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Join the chat
    Chat {
        /// Nickname to announce
        #[arg(short, long)]
        name: Option<String>,

        /// Port to accept peers on
        #[arg(short, long)]
        port: Option<u16>,

        /// Rendezvous server as host:port
        #[arg(short, long)]
        rendezvous: Option<String>,

        /// Peer to dial at startup, as host:port
        #[arg(long)]
        connect: Vec<String>,

        /// Skip registering with the rendezvous server
        #[arg(long)]
        no_register: bool,
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(cli.verbose || config.general.verbose, config.general.log_file.as_deref())?;

    match cli.command {
        Commands::Rendezvous { port, bind } => {
            run_rendezvous(config, port, bind).await?;
        }
        Commands::Chat {
            name,
            port,
            rendezvous,
            connect,
            no_register,
        } => {
            let options = ChatOptions {
                name,
                port,
                rendezvous,
                connect,
                register: !no_register,
            };
            run_chat(config, options).await?;
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

/// Initialize logging; RUST_LOG overrides the level
fn init_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => {
            registry.with(fmt::layer().with_writer(std::io::stderr)).init();
        }
    }
    Ok(())
}

/// Split "host:port", taking the last colon so bracketless hosts still work
fn parse_endpoint(s: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got '{}'", s))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("missing host in '{}'", s);
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in '{}'", s))?;
    Ok((host.to_string(), port))
}

/// Run the rendezvous server until Ctrl+C
async fn run_rendezvous(
    mut config: Config,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.rendezvous.port = port;
    }
    if bind.is_some() {
        config.rendezvous.bind_address = bind;
    }

    let bind_addr = config.rendezvous_bind_addr()?;
    let server = RendezvousServer::start(bind_addr, config.network.reactor())?;

    println!("Rendezvous server listening on {}", server.local_addr());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let registered = server.entries().len();
    server.shutdown();
    server.join()?;
    tracing::info!("Rendezvous server stopped with {} registrations", registered);

    Ok(())
}

struct ChatOptions {
    name: Option<String>,
    port: Option<u16>,
    rendezvous: Option<String>,
    connect: Vec<String>,
    register: bool,
}

/// Run an interactive chat node
async fn run_chat(mut config: Config, options: ChatOptions) -> anyhow::Result<()> {
    if let Some(name) = options.name {
        config.general.name = name;
    }
    if let Some(port) = options.port {
        config.network.port = port;
    }
    let (rv_host, rv_port) = match &options.rendezvous {
        Some(endpoint) => parse_endpoint(endpoint)?,
        None => (config.rendezvous.host.clone(), config.rendezvous.port),
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let node = Node::start(config.node_config()?, Arc::new(event_tx))?;

    println!("Chatting as '{}' on {}", node.local_name(), node.local_addr());
    println!("Type /help for commands.\n");

    if options.register {
        node.register_self_with_rendezvous(&rv_host, rv_port).await;
    }
    for endpoint in &options.connect {
        let (host, port) = parse_endpoint(endpoint)?;
        node.connect_to(&host, port).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&node, line.trim(), &rv_host, rv_port).await {
                    break;
                }
            }
            Some(event) = event_rx.recv() => {
                print_event(event);
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("Leaving...");
    node.shutdown();
    node.join()?;
    tracing::info!("Chat node stopped");

    Ok(())
}

/// Handle one input line; false ends the session
async fn handle_line(node: &Node, line: &str, rv_host: &str, rv_port: u16) -> bool {
    if line.is_empty() {
        return true;
    }
    let Some(command) = line.strip_prefix('/') else {
        report(node.send_text(line, None));
        return true;
    };

    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();

    match verb {
        "quit" | "exit" => return false,
        "nick" if !rest.is_empty() => report(node.set_local_name(rest)),
        "kick" if !rest.is_empty() => report(node.kick(rest)),
        "nick" | "kick" => println!("usage: /{} <name>", verb),
        "msg" => match rest.split_once(' ') {
            Some((target, text)) => report(node.send_text(text.trim(), Some(target))),
            None => println!("usage: /msg <name> <text>"),
        },
        "connect" => match parse_endpoint(rest) {
            Ok((host, port)) => {
                if let Err(e) = node.connect_to(&host, port).await {
                    println!("! {}", e);
                }
            }
            Err(e) => println!("! {}", e),
        },
        "disconnect" => match rest.parse() {
            Ok(ip) => report(node.disconnect(ip)),
            Err(_) => println!("usage: /disconnect <ip>"),
        },
        "register" => {
            if node.register_self_with_rendezvous(rv_host, rv_port).await {
                println!("* registered with {}:{}", rv_host, rv_port);
            }
        }
        "find" => {
            let entries = node.list_peers_from_rendezvous(rv_host, rv_port).await;
            println!("* rendezvous lists {} peer(s)", entries.len());
            for entry in entries {
                let addr = entry.socket_addr();
                if let Err(e) = node.connect_to(&addr.ip().to_string(), addr.port()).await {
                    println!("! {}: {}", entry, e);
                }
            }
        }
        "peers" => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("* no peers");
            }
            for peer in peers {
                println!("* {} at {} (port {})", peer.name, peer.addr, peer.port);
            }
        }
        "help" => print_help(),
        _ => println!("! unknown command, try /help"),
    }
    true
}

fn report<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        println!("! {}", e);
    }
}

fn print_help() {
    println!("  /nick <name>          change your nickname");
    println!("  /msg <name> <text>    message one peer");
    println!("  /kick <name>          drop a peer");
    println!("  /connect <host:port>  dial a peer");
    println!("  /disconnect <ip>      drop every connection to a host");
    println!("  /register             register with the rendezvous server");
    println!("  /find                 dial every peer the rendezvous server knows");
    println!("  /peers                list connected peers");
    println!("  /quit                 leave");
}

fn print_event(event: ChatEvent) {
    match event {
        ChatEvent::Message { from, text } => println!("<{}> {}", from, text),
        ChatEvent::PeerJoined(peer) => println!("* {} joined from {}", peer.name, peer.addr),
        ChatEvent::PeerLeft { peer, timed_out } => {
            if timed_out {
                println!("* {} timed out", peer.name);
            } else {
                println!("* {} left", peer.name);
            }
        }
        ChatEvent::PeerRenamed { old, new, .. } => println!("* {} is now {}", old, new),
        ChatEvent::LocalRenamed { new, .. } => println!("* you are now {}", new),
        ChatEvent::PeerDiscovered { host, port, from } => {
            println!("* {} knows {}:{} (use /connect)", from, host, port)
        }
        ChatEvent::ConnectFailed { addr, reason } => println!("! could not reach {}: {}", addr, reason),
        ChatEvent::RendezvousUnreachable => println!("! rendezvous server unreachable"),
        ChatEvent::Voice { from, data } => {
            tracing::debug!("Voice frame from {} ({} bytes)", from, data.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["peerchat", "chat", "--name", "alice", "--no-register"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["peerchat", "rendezvous", "--port", "7000"]).unwrap();
        assert!(matches!(cli.command, Commands::Rendezvous { port: Some(7000), .. }));
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("example.org:9118").unwrap(), ("example.org".to_string(), 9118));
        assert_eq!(parse_endpoint("[::1]:9119").unwrap(), ("::1".to_string(), 9119));
        assert!(parse_endpoint("example.org").is_err());
        assert!(parse_endpoint(":9118").is_err());
        assert!(parse_endpoint("host:99999").is_err());
    }
}
