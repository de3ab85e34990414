use crate::PROTOCOL_VERSION;
use crate::catalog::{CatalogSnapshot, DirectoryEntry, ServerRoot};
use crate::config::AppConfig;
use crate::discovery::DiscoveryResponder;
use crate::error::{ShareError, ShareResult};
use anyhow::Result;
use quinn::{Connection, Endpoint, Incoming};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{ControlMsg, recv_msg, send_msg};
use super::quic::make_server_endpoint;
use super::sender::serve_file;
use super::utils::TransferGauge;

/// Where the server binds and what it calls itself
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub transfer_addr: SocketAddr,
    pub discovery_addr: SocketAddr,
    pub server_name: String,
}

impl ServerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            transfer_addr: SocketAddr::from(([0, 0, 0, 0], config.transfer_port)),
            discovery_addr: SocketAddr::from(([0, 0, 0, 0], config.discovery_port)),
            server_name: crate::local_name(),
        }
    }

    /// Loopback-only, ephemeral ports
    pub fn loopback() -> Self {
        Self {
            transfer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            server_name: crate::local_name(),
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// State every connection handler reads. The root is the only piece that
/// changes while the server runs.
struct ServerContext {
    root: ServerRoot,
    server_name: String,
    gauge: TransferGauge,
}

pub struct Server;

impl Server {
    /// Bind discovery and the transfer endpoint, then start serving.
    ///
    /// Any bind failure aborts startup.
    pub async fn start(options: ServerOptions, root: ServerRoot) -> ShareResult<ServerHandle> {
        let endpoint = make_server_endpoint(options.transfer_addr)?;
        let local_addr = endpoint.local_addr()?;

        let discovery = DiscoveryResponder::bind(
            options.discovery_addr,
            options.server_name.clone(),
            local_addr.port(),
        )
        .await?;
        discovery.start_responding()?;

        let ctx = Arc::new(ServerContext {
            root,
            server_name: options.server_name,
            gauge: TransferGauge::default(),
        });
        let cancel = CancellationToken::new();

        info!(
            "Server '{}' listening at {} sharing {}",
            ctx.server_name,
            local_addr,
            ctx.root.current().display()
        );

        let accept_task = tokio::spawn(run_server(endpoint.clone(), ctx.clone(), cancel.clone()));

        Ok(ServerHandle {
            endpoint,
            ctx,
            discovery,
            cancel,
            accept_task,
        })
    }
}

/// A running server role.
pub struct ServerHandle {
    endpoint: Endpoint,
    ctx: Arc<ServerContext>,
    discovery: DiscoveryResponder,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> ShareResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn discovery_addr(&self) -> ShareResult<SocketAddr> {
        self.discovery.local_addr()
    }

    /// The responder is already running; a second start is `AlreadyListening`
    pub fn start_responding(&self) -> ShareResult<()> {
        self.discovery.start_responding()
    }

    pub async fn select_root(&self, path: impl AsRef<Path>) -> ShareResult<PathBuf> {
        self.ctx.root.select(path).await
    }

    pub fn current_root(&self) -> PathBuf {
        self.ctx.root.current().as_ref().clone()
    }

    pub async fn list_entries(&self) -> ShareResult<Vec<DirectoryEntry>> {
        self.ctx.root.list_entries().await
    }

    pub fn root(&self) -> &ServerRoot {
        &self.ctx.root
    }

    /// Transfers currently holding an open file
    pub fn active_transfers(&self) -> usize {
        self.ctx.gauge.active()
    }

    /// Stop accepting, close every connection and stop discovery replies
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.discovery.stop();
        self.endpoint.close(0u32.into(), b"server shutdown");
        let _ = self.accept_task.await;
        self.endpoint.wait_idle().await;
        info!("Server stopped");
    }
}

async fn run_server(endpoint: Endpoint, ctx: Arc<ServerContext>, cancel: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, ctx).await {
                warn!("Connection ended with error: {}", e);
            }
        });
    }
    debug!("Accept loop finished");
}

async fn handle_connection(incoming: Incoming, ctx: Arc<ServerContext>) -> Result<()> {
    let connection = incoming.await?;
    let remote_addr = connection.remote_address();
    info!("Connection from {}", remote_addr);

    let greeted = Arc::new(AtomicBool::new(false));

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                info!("Client {} disconnected", remote_addr);
                break;
            }
            Err(e) => {
                info!("Connection to {} lost: {}", remote_addr, e);
                break;
            }
        };

        // Each request gets its own task, stream and buffers
        let ctx = ctx.clone();
        let greeted = greeted.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(send, recv, &ctx, &greeted, &connection).await {
                debug!("Stream from {} aborted: {}", remote_addr, e);
            }
        });
    }
    Ok(())
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    ctx: &ServerContext,
    greeted: &AtomicBool,
    connection: &Connection,
) -> Result<()> {
    let msg = recv_msg(&mut recv).await?;

    match msg {
        ControlMsg::Hello {
            protocol_version,
            client_name,
        } => {
            if protocol_version == PROTOCOL_VERSION {
                greeted.store(true, Ordering::SeqCst);
                info!(
                    "Handshake with '{}' ({}) complete",
                    client_name,
                    connection.remote_address()
                );
                send_msg(
                    &mut send,
                    &ControlMsg::Welcome {
                        protocol_version: PROTOCOL_VERSION,
                        server_name: ctx.server_name.clone(),
                    },
                )
                .await?;
            } else {
                warn!(
                    "Rejecting '{}': protocol {} (ours {})",
                    client_name, protocol_version, PROTOCOL_VERSION
                );
                send_msg(
                    &mut send,
                    &ControlMsg::Rejected {
                        message: format!(
                            "protocol version {} not supported (server speaks {})",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    },
                )
                .await?;
            }
        }
        _ if !greeted.load(Ordering::SeqCst) => {
            warn!(
                "Request before handshake from {}",
                connection.remote_address()
            );
            send_msg(
                &mut send,
                &ControlMsg::Rejected {
                    message: "handshake required".to_string(),
                },
            )
            .await?;
        }
        ControlMsg::CatalogRequest => match ctx.root.snapshot().await {
            Ok(snapshot) => send_catalog(&mut send, snapshot).await?,
            Err(e) => {
                error!("Listing root failed: {}", e);
                send_msg(
                    &mut send,
                    &ControlMsg::CatalogUnavailable {
                        root: ctx.root.current().as_ref().clone(),
                        message: e.to_string(),
                    },
                )
                .await?;
            }
        },
        ControlMsg::FileRequest { name } => {
            if let Err(e) = serve_file(&ctx.root, &name, &mut send, &ctx.gauge).await {
                // Client went away or the file broke mid-stream; drop what is in flight
                let _ = send.reset(1u32.into());
                return Err(e);
            }
        }
        other => {
            send_msg(
                &mut send,
                &ControlMsg::Rejected {
                    message: format!("unexpected request: {:?}", other),
                },
            )
            .await?;
        }
    }

    send.finish()?;
    // Wait until the peer has the data (or gave up) before dropping the stream
    let _ = send.stopped().await;
    Ok(())
}

/// Stream a listing as a header and one record per entry, so its size is not
/// bounded by a single control frame.
async fn send_catalog<W>(send: &mut W, snapshot: CatalogSnapshot) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = ControlMsg::CatalogHeader {
        root: snapshot.root.clone(),
        count: snapshot.entries.len() as u64,
    };
    match send_msg(send, &header).await {
        Ok(()) => {}
        // Oversized frames are refused before anything is written
        Err(ShareError::Protocol(message)) => {
            error!("Cannot describe root {}: {}", snapshot.root.display(), message);
            send_msg(
                send,
                &ControlMsg::CatalogUnavailable {
                    root: snapshot.root,
                    message,
                },
            )
            .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    debug!("Sending catalog of {} entries", snapshot.entries.len());
    for entry in snapshot.entries {
        send_msg(send, &ControlMsg::CatalogEntry { entry }).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::constants::MAX_MSG_SIZE;

    #[tokio::test]
    async fn test_large_catalog_is_split_into_records() {
        let entries: Vec<_> = (0..5000)
            .map(|i| DirectoryEntry::file(format!("photo_from_holiday_2024_{:05}.jpg", i)))
            .collect();
        let snapshot = CatalogSnapshot {
            root: PathBuf::from("/srv/photos"),
            entries: entries.clone(),
        };

        let mut wire = Vec::new();
        send_catalog(&mut wire, snapshot).await.unwrap();

        let mut reader = &wire[..];
        assert_eq!(
            recv_msg(&mut reader).await.unwrap(),
            ControlMsg::CatalogHeader {
                root: PathBuf::from("/srv/photos"),
                count: 5000
            }
        );
        for expected in entries {
            assert_eq!(
                recv_msg(&mut reader).await.unwrap(),
                ControlMsg::CatalogEntry { entry: expected }
            );
        }
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_undescribable_root_is_answered_unavailable() {
        let snapshot = CatalogSnapshot {
            root: PathBuf::from("x".repeat(MAX_MSG_SIZE + 1)),
            entries: vec![DirectoryEntry::file("a.txt")],
        };

        let mut wire = Vec::new();
        send_catalog(&mut wire, snapshot).await.unwrap();

        assert!(matches!(
            recv_msg(&mut &wire[..]).await.unwrap(),
            ControlMsg::CatalogUnavailable { .. }
        ));
    }
}
