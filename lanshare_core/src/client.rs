//! Client role: one session to one server at a time.
//!
//! Session state lives in a `watch` channel so observers never wait on a
//! connect in progress. The QUIC connection is kept separately; every catalog
//! fetch or file request clones it and opens its own stream, which is what lets
//! several requests run side by side.

use crate::catalog::CatalogSnapshot;
use crate::config::AppConfig;
use crate::discovery::{self, PeerAddress};
use crate::error::{ShareError, ShareResult};
use crate::transfer::make_client_endpoint;
use crate::transfer::protocol::{ControlMsg, recv_msg, send_msg};
use crate::transfer::receiver::receive_file;
use crate::transfer::utils::{ProgressReporter, create_unique_file, sanitize_file_name};
use crate::{PROTOCOL_VERSION, ShareEvent};
use quinn::{Connection, Endpoint};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient: a failed connect passes through here on its way to `Disconnected`
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peer: Option<PeerAddress>,
    pub state: SessionState,
}

impl Session {
    fn disconnected() -> Self {
        Self {
            peer: None,
            state: SessionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub probe_targets: Vec<SocketAddr>,
    pub discovery_timeout: Duration,
    pub handshake_timeout: Duration,
    pub download_dir: PathBuf,
    pub client_name: String,
}

impl ClientOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            probe_targets: config.probe_targets(),
            discovery_timeout: config.discovery_timeout(),
            handshake_timeout: config.handshake_timeout(),
            download_dir: config.download_dir.clone(),
            client_name: crate::local_name(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

struct Link {
    peer: PeerAddress,
    connection: Connection,
}

/// Publishes session changes to the watch channel and the event listener
struct SessionCell {
    tx: watch::Sender<Session>,
    events: Option<mpsc::Sender<ShareEvent>>,
}

impl SessionCell {
    fn set(&self, peer: Option<PeerAddress>, state: SessionState) {
        let session = Session { peer, state };
        debug!("Session -> {:?}", session);
        self.tx.send_replace(session);
        if let Some(events) = &self.events {
            let _ = events.try_send(ShareEvent::SessionChanged { peer, state });
        }
    }
}

pub struct Client {
    endpoint: Endpoint,
    options: ClientOptions,
    link: Arc<Mutex<Option<Link>>>,
    session: Arc<SessionCell>,
    /// Serializes `connect` so a failed attempt settles before the next starts
    connect_gate: tokio::sync::Mutex<()>,
    /// Cancelled by `disconnect` to abandon a connect still in flight
    pending_connect: Mutex<Option<CancellationToken>>,
    catalog: Mutex<Option<CatalogSnapshot>>,
    events: Option<mpsc::Sender<ShareEvent>>,
}

impl Client {
    /// Create a client in the `Disconnected` state. Must run inside a tokio runtime.
    pub fn new(options: ClientOptions) -> ShareResult<Self> {
        Self::build(options, None)
    }

    /// Like [`Client::new`], also reporting session and transfer events
    pub fn with_events(
        options: ClientOptions,
        events: mpsc::Sender<ShareEvent>,
    ) -> ShareResult<Self> {
        Self::build(options, Some(events))
    }

    fn build(options: ClientOptions, events: Option<mpsc::Sender<ShareEvent>>) -> ShareResult<Self> {
        let endpoint = make_client_endpoint()?;
        let (tx, _rx) = watch::channel(Session::disconnected());

        Ok(Self {
            endpoint,
            options,
            link: Arc::new(Mutex::new(None)),
            session: Arc::new(SessionCell {
                tx,
                events: events.clone(),
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            pending_connect: Mutex::new(None),
            catalog: Mutex::new(None),
            events,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Probe the LAN and collect servers until `timeout` elapses
    pub async fn discover_peers(&self, timeout: Duration) -> ShareResult<Vec<PeerAddress>> {
        discovery::discover_peers(&self.options.probe_targets, timeout).await
    }

    pub fn current_state(&self) -> SessionState {
        self.session.tx.borrow().state
    }

    pub fn session(&self) -> Session {
        self.session.tx.borrow().clone()
    }

    /// Watch session changes (e.g. to notice a dropped server)
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.tx.subscribe()
    }

    /// Open a session to `peer`, replacing any current one.
    ///
    /// Dial plus handshake is bounded by the handshake timeout. On any failure
    /// the session passes through `Error` and ends `Disconnected`. A
    /// `disconnect` while this is pending abandons the attempt.
    pub async fn connect(&self, peer: PeerAddress) -> ShareResult<()> {
        let _gate = self.connect_gate.lock().await;

        if let Some(old) = self.take_link() {
            info!("Closing session to {} before connecting to {}", old.peer, peer);
            old.connection.close(0u32.into(), b"switching peer");
        }
        let attempt = CancellationToken::new();
        *self.lock_pending() = Some(attempt.clone());
        self.session.set(Some(peer), SessionState::Connecting);

        let result = tokio::select! {
            res = tokio::time::timeout(self.options.handshake_timeout, self.dial(peer)) => res,
            _ = attempt.cancelled() => {
                info!("Connect to {} abandoned", peer);
                return Err(ShareError::Connection(format!("connect to {} cancelled", peer)));
            }
        };

        let connection = match result {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(self.connect_failed(peer, e)),
            Err(_) => {
                let e = ShareError::Connection(format!(
                    "handshake with {} timed out after {:?}",
                    peer, self.options.handshake_timeout
                ));
                return Err(self.connect_failed(peer, e));
            }
        };

        {
            // Install and publish under the link lock so `disconnect` sees
            // either nothing or the finished session
            let mut link = self.lock_link();
            if attempt.is_cancelled() {
                connection.close(0u32.into(), b"disconnect");
                return Err(ShareError::Connection(format!("connect to {} cancelled", peer)));
            }
            *link = Some(Link {
                peer,
                connection: connection.clone(),
            });
            self.session.set(Some(peer), SessionState::Connected);
            self.lock_pending().take();
        }
        self.watch_connection(peer, connection);
        info!("Connected to {}", peer);
        Ok(())
    }

    /// Close the session if there is one, abandoning any connect in
    /// progress. Calling it again is a no-op.
    pub fn disconnect(&self) {
        if let Some(attempt) = self.lock_pending().take() {
            attempt.cancel();
        }
        let mut link = self.lock_link();
        if let Some(old) = link.take() {
            info!("Disconnecting from {}", old.peer);
            old.connection.close(0u32.into(), b"disconnect");
        }
        if self.current_state() != SessionState::Disconnected {
            self.session.set(None, SessionState::Disconnected);
        }
    }

    /// Fetch root and entries from the server and cache them
    pub async fn fetch_catalog(&self) -> ShareResult<CatalogSnapshot> {
        let connection = self.connection()?;
        let (mut send, mut recv) = connection.open_bi().await?;

        send_msg(&mut send, &ControlMsg::CatalogRequest).await?;
        let _ = send.finish();

        let (root, count) = match recv_msg(&mut recv).await? {
            ControlMsg::CatalogHeader { root, count } => (root, count),
            ControlMsg::CatalogUnavailable { root, message } => {
                return Err(ShareError::DirectoryUnavailable {
                    path: root,
                    reason: message,
                });
            }
            ControlMsg::Rejected { message } => return Err(ShareError::Connection(message)),
            other => {
                return Err(ShareError::Protocol(format!(
                    "Expected CatalogHeader, got {:?}",
                    other
                )));
            }
        };

        // The count is the server's word; grow as records actually arrive
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            match recv_msg(&mut recv).await? {
                ControlMsg::CatalogEntry { entry } => entries.push(entry),
                other => {
                    return Err(ShareError::Protocol(format!(
                        "Expected CatalogEntry, got {:?}",
                        other
                    )));
                }
            }
        }
        let snapshot = CatalogSnapshot { root, entries };

        debug!(
            "Catalog of {} has {} entries",
            snapshot.root.display(),
            snapshot.entries.len()
        );
        *self.catalog.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Last catalog fetched, if any
    pub fn cached_catalog(&self) -> Option<CatalogSnapshot> {
        self.catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch a file's content into memory
    pub async fn request_file(&self, name: &str) -> ShareResult<Vec<u8>> {
        let mut content = Vec::new();
        self.request_file_to(name, &mut content, &CancellationToken::new())
            .await?;
        Ok(content)
    }

    /// Stream a file into `sink`, chunk by chunk.
    ///
    /// The name need not be in the cached catalog; the server decides.
    /// Cancelling `cancel` (or dropping this future) stops the stream and the
    /// server releases its file handle.
    pub async fn request_file_to<W>(
        &self,
        name: &str,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> ShareResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let connection = self.connection()?;
        let mut progress = ProgressReporter::new(self.events.clone(), name, 0);

        let result = fetch_into(&connection, name, sink, &mut progress, cancel).await;

        match &result {
            Ok(bytes) => {
                progress.completed();
                info!("Received {} ({} bytes)", name, bytes);
            }
            Err(e) => {
                progress.failed(&e.to_string());
                if e.is_stale_catalog() {
                    debug!("{} is stale in our catalog: {}", name, e);
                } else {
                    warn!("Request for {} failed: {}", name, e);
                }
            }
        }
        result
    }

    /// Download a file into `dest_dir` (or the configured download dir) without
    /// overwriting anything already there. A failed download leaves no file.
    pub async fn download_file(
        &self,
        name: &str,
        dest_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> ShareResult<PathBuf> {
        // Fail fast before creating anything locally
        self.connection()?;

        let dir = dest_dir.unwrap_or(&self.options.download_dir);
        tokio::fs::create_dir_all(dir).await?;

        let (path, mut file) = create_unique_file(dir, &sanitize_file_name(name)).await?;
        match self.request_file_to(name, &mut file, cancel).await {
            Ok(_) => {
                file.sync_all().await?;
                info!("Saved {} to {}", name, path.display());
                Ok(path)
            }
            Err(e) => {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!("Could not remove partial file {}: {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }

    /// Discover, connect to the first server that accepts, and fetch its catalog
    pub async fn connect_first(&self, timeout: Duration) -> ShareResult<CatalogSnapshot> {
        let peers = self.discover_peers(timeout).await?;
        if peers.is_empty() {
            return Err(ShareError::DiscoveryTimeout);
        }

        let mut last_err = ShareError::DiscoveryTimeout;
        for peer in peers {
            match self.connect(peer).await {
                Ok(()) => return self.fetch_catalog().await,
                Err(e) => {
                    warn!("Skipping {}: {}", peer, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial(&self, peer: PeerAddress) -> ShareResult<Connection> {
        let connection = self
            .endpoint
            .connect(peer.socket_addr(), "localhost")?
            .await?;

        match self.handshake(&connection).await {
            Ok(server_name) => {
                info!("Handshake with '{}' at {} complete", server_name, peer);
                Ok(connection)
            }
            Err(e) => {
                connection.close(0u32.into(), b"handshake failed");
                Err(e)
            }
        }
    }

    async fn handshake(&self, connection: &Connection) -> ShareResult<String> {
        let (mut send, mut recv) = connection.open_bi().await?;
        send_msg(
            &mut send,
            &ControlMsg::Hello {
                protocol_version: PROTOCOL_VERSION,
                client_name: self.options.client_name.clone(),
            },
        )
        .await?;
        let _ = send.finish();

        match recv_msg(&mut recv).await? {
            ControlMsg::Welcome {
                protocol_version,
                server_name,
            } if protocol_version == PROTOCOL_VERSION => Ok(server_name),
            ControlMsg::Welcome {
                protocol_version, ..
            } => Err(ShareError::Connection(format!(
                "server speaks protocol {}, we speak {}",
                protocol_version, PROTOCOL_VERSION
            ))),
            ControlMsg::Rejected { message } => Err(ShareError::Connection(message)),
            other => Err(ShareError::Connection(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
        }
    }

    fn connect_failed(&self, peer: PeerAddress, e: ShareError) -> ShareError {
        warn!("Connect to {} failed: {}", peer, e);
        self.lock_pending().take();
        self.session.set(Some(peer), SessionState::Error);
        self.session.set(None, SessionState::Disconnected);
        match e {
            ShareError::Connection(_) => e,
            other => ShareError::Connection(other.to_string()),
        }
    }

    /// Mark the session lost when this connection closes underneath us
    fn watch_connection(&self, peer: PeerAddress, connection: Connection) {
        let link = self.link.clone();
        let session = self.session.clone();
        let stable_id = connection.stable_id();

        tokio::spawn(async move {
            let reason = connection.closed().await;
            let mut guard = link.lock().unwrap_or_else(PoisonError::into_inner);
            let still_current = guard
                .as_ref()
                .is_some_and(|l| l.connection.stable_id() == stable_id);
            if still_current {
                *guard = None;
                drop(guard);
                warn!("Session to {} lost: {}", peer, reason);
                session.set(None, SessionState::Disconnected);
            }
        });
    }

    fn connection(&self) -> ShareResult<Connection> {
        self.lock_link()
            .as_ref()
            .map(|l| l.connection.clone())
            .ok_or(ShareError::NotConnected)
    }

    fn take_link(&self) -> Option<Link> {
        self.lock_link().take()
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.pending_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One file request on its own stream. Every failure past the connection
/// check is a transfer outcome.
async fn fetch_into<W>(
    connection: &Connection,
    name: &str,
    sink: &mut W,
    progress: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> ShareResult<u64>
where
    W: AsyncWrite + Unpin,
{
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| ShareError::Transfer(e.to_string()))?;
    send_msg(&mut send, &ControlMsg::FileRequest { name: name.to_string() })
        .await
        .map_err(|e| ShareError::Transfer(e.to_string()))?;
    let _ = send.finish();

    tokio::select! {
        res = receive_file(&mut recv, sink, name, progress) => res,
        _ = cancel.cancelled() => {
            let _ = recv.stop(0u32.into());
            Err(ShareError::Transfer("cancelled".to_string()))
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(link) = self.take_link() {
            link.connection.close(0u32.into(), b"client shutdown");
        }
        self.endpoint.close(0u32.into(), b"client shutdown");
    }
}
