use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanshare_core::config::AppConfig;
use lanshare_core::{
    CatalogSnapshot, Client, ClientOptions, EntryKind, PeerAddress, Server, ServerOptions,
    ServerRoot, ShareEvent,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lanshare")]
#[command(about = "Share a directory with peers on the local network")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a directory and answer discovery probes until Ctrl-C
    Serve {
        /// Directory to share (defaults to the configured root)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Look for servers on the LAN
    Scan {
        /// How long to wait for replies
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Show what a server is sharing
    List {
        /// Server address, `ip:port` or a bare ip
        peer: PeerAddress,
    },

    /// Download one file from a server
    Get {
        peer: PeerAddress,

        /// Entry name as listed by the server
        name: String,

        /// Destination directory (defaults to the configured download dir)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Connect to the first server that answers and list its files
    Auto,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load environment variables from .env file (RUST_LOG, LANSHARE_CONFIG_DIR)
    let _ = dotenvy::dotenv();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("{},quinn=warn", log_level))
            }),
        )
        .init();

    let config = AppConfig::load();

    match args.command {
        Commands::Serve { root } => serve(&config, root).await,
        Commands::Scan { timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.discovery_timeout());
            scan(&config, timeout).await
        }
        Commands::List { peer } => {
            let client = Client::new(ClientOptions::from_config(&config))?;
            client.connect(peer).await?;
            let catalog = client.fetch_catalog().await?;
            print_catalog(peer, &catalog);
            client.disconnect();
            Ok(())
        }
        Commands::Get { peer, name, out } => get(&config, peer, &name, out).await,
        Commands::Auto => {
            let client = Client::new(ClientOptions::from_config(&config))?;
            let catalog = client.connect_first(config.discovery_timeout()).await?;
            if let Some(peer) = client.session().peer {
                print_catalog(peer, &catalog);
            }
            client.disconnect();
            Ok(())
        }
    }
}

async fn serve(config: &AppConfig, root: Option<PathBuf>) -> Result<()> {
    let root_path = root.unwrap_or_else(|| config.server_root.clone());
    let root = ServerRoot::new(&root_path)
        .await
        .with_context(|| format!("Cannot share {}", root_path.display()))?;

    let server = Server::start(ServerOptions::from_config(config), root).await?;
    let port = server.local_addr()?.port();

    match local_ip_address::local_ip() {
        Ok(ip) => info!("Reachable at {}:{}", ip, port),
        Err(e) => warn!("Could not determine LAN address: {}", e),
    }
    println!(
        "Sharing {} on port {} (Ctrl-C to stop)",
        server.current_root().display(),
        port
    );
    println!("Commands: root <DIR>, ls, pwd");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                // stdin closed (e.g. running detached); keep serving
                None => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        };

        match OperatorCommand::parse(&line) {
            Some(OperatorCommand::SelectRoot(path)) => match server.select_root(&path).await {
                Ok(root) => println!("Now sharing {}", root.display()),
                Err(e) => println!("Keeping {}: {}", server.current_root().display(), e),
            },
            Some(OperatorCommand::List) => match server.list_entries().await {
                Ok(entries) => {
                    for entry in entries {
                        let marker = if entry.is_folder() { "/" } else { "" };
                        println!("  {}{}", entry.name, marker);
                    }
                }
                Err(e) => println!("{}", e),
            },
            Some(OperatorCommand::ShowRoot) => println!("{}", server.current_root().display()),
            None if line.trim().is_empty() => {}
            None => println!("Unknown command: {}", line.trim()),
        }
    }

    info!("Shutting down");
    server.shutdown().await;
    Ok(())
}

/// Commands typed at a running server
#[derive(Debug, PartialEq, Eq)]
enum OperatorCommand {
    SelectRoot(PathBuf),
    List,
    ShowRoot,
}

impl OperatorCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match word {
            "root" | "cd" if !rest.is_empty() => Some(Self::SelectRoot(PathBuf::from(rest))),
            "ls" | "list" if rest.is_empty() => Some(Self::List),
            "pwd" if rest.is_empty() => Some(Self::ShowRoot),
            _ => None,
        }
    }
}

async fn scan(config: &AppConfig, timeout: Duration) -> Result<()> {
    let peers = lanshare_core::discover_peers(&config.probe_targets(), timeout).await?;
    if peers.is_empty() {
        println!("No servers answered within {:?}", timeout);
    }
    for peer in peers {
        println!("{}", peer);
    }
    Ok(())
}

async fn get(config: &AppConfig, peer: PeerAddress, name: &str, out: Option<PathBuf>) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<ShareEvent>(1000);
    let client = Client::with_events(ClientOptions::from_config(config), event_tx)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ShareEvent::TransferProgress {
                    file_name,
                    bytes_done,
                    total_bytes,
                    speed,
                } => {
                    let percent = if total_bytes > 0 {
                        bytes_done * 100 / total_bytes
                    } else {
                        100
                    };
                    println!("{}: {}% ({})", file_name, percent, speed);
                }
                ShareEvent::TransferFailed { file_name, reason } => {
                    warn!("{} failed: {}", file_name, reason);
                }
                ShareEvent::SessionChanged { peer, state } => {
                    info!("Session {:?} ({:?})", state, peer);
                }
                ShareEvent::TransferCompleted { .. } => {}
            }
        }
    });

    client.connect(peer).await?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let result = client.download_file(name, out.as_deref(), &cancel).await;
    client.disconnect();
    drop(client);
    let _ = printer.await;

    let path = result?;
    println!("Saved {}", path.display());
    Ok(())
}

fn print_catalog(peer: PeerAddress, catalog: &CatalogSnapshot) {
    println!("{} shares {}", peer, catalog.root.display());
    for entry in &catalog.entries {
        let marker = match entry.kind {
            EntryKind::Folder => "/",
            EntryKind::File => "",
        };
        println!("  {}{}", entry.name, marker);
    }
}
