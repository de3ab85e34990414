use crate::error::{ShareError, ShareResult};
use crate::transfer::TRANSFER_PORT;
use crate::{DiscoveryMsg, MAGIC_BYTES};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default UDP port the discovery responder listens on
pub const DISCOVERY_PORT: u16 = 9999;

/// Largest datagram we bother reading; anything longer is not ours
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Connectable address of a server found on the LAN.
///
/// Two addresses are the same peer when their normalized `ip:port` forms match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        // Collapse v4-mapped v6 so the same host never shows up twice
        let ip = match addr.ip() {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self(SocketAddr::new(ip, addr.port()))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = ShareError;

    /// Accepts `ip:port`, `[v6]:port`, or a bare IP (default transfer port).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::new(addr));
        }
        s.parse::<IpAddr>()
            .map(|ip| Self::new(SocketAddr::new(ip, TRANSFER_PORT)))
            .map_err(|_| ShareError::Connection(format!("invalid peer address: {}", s)))
    }
}

/// Prefix the magic marker to a serialized discovery message
pub fn encode_packet(msg: &DiscoveryMsg) -> Option<Vec<u8>> {
    let json_bytes = serde_json::to_vec(msg).ok()?;
    let mut packet = MAGIC_BYTES.to_vec();
    packet.extend_from_slice(&json_bytes);
    Some(packet)
}

/// Parse a datagram; `None` for anything that is not one of ours
pub fn decode_packet(packet: &[u8]) -> Option<DiscoveryMsg> {
    let data = packet.strip_prefix(MAGIC_BYTES)?;
    serde_json::from_slice(data).ok()
}

/// Server side of discovery: answers probes with our transfer port.
pub struct DiscoveryResponder {
    socket: Arc<UdpSocket>,
    server_name: String,
    transfer_port: u16,
    listening: AtomicBool,
    cancel: CancellationToken,
}

impl DiscoveryResponder {
    /// Bind the discovery socket. Failing here aborts server startup.
    pub async fn bind(
        addr: SocketAddr,
        server_name: String,
        transfer_port: u16,
    ) -> ShareResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ShareError::Bind {
                what: "discovery socket",
                source,
            })?;

        Ok(Self {
            socket: Arc::new(socket),
            server_name,
            transfer_port,
            listening: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> ShareResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the reply loop. Only one loop may ever run per responder.
    pub fn start_responding(&self) -> ShareResult<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ShareError::AlreadyListening);
        }

        let socket = self.socket.clone();
        let cancel = self.cancel.clone();
        let server_name = self.server_name.clone();
        let transfer_port = self.transfer_port;

        if let Ok(addr) = socket.local_addr() {
            info!("Discovery responder listening on {}", addr);
        }

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, from) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = socket.recv_from(&mut buf) => match res {
                        Ok(v) => v,
                        // ICMP port-unreachable surfaces here on some platforms
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                        Err(e) => {
                            warn!("Discovery socket error, stopping responder: {}", e);
                            break;
                        }
                    },
                };

                let nonce = match decode_packet(&buf[..len]) {
                    Some(DiscoveryMsg::Probe { nonce }) => nonce,
                    Some(DiscoveryMsg::Announce { .. }) => continue,
                    None => {
                        debug!("Dropping unrecognized datagram from {}", from);
                        continue;
                    }
                };

                let reply = DiscoveryMsg::Announce {
                    nonce,
                    server_name: server_name.clone(),
                    port: transfer_port,
                };
                if let Some(packet) = encode_packet(&reply) {
                    match socket.send_to(&packet, from).await {
                        Ok(_) => debug!("Sent discovery reply to {}", from),
                        Err(e) => warn!("Failed to reply to probe from {}: {}", from, e),
                    }
                }
            }
            info!("Discovery responder stopped");
        });

        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Client side of discovery: probe `targets` from every usable local
/// interface, then collect replies until `timeout` elapses.
///
/// Peers come back deduplicated in first-seen order. Nobody answering is an
/// empty list, not an error.
pub async fn discover_peers(
    targets: &[SocketAddr],
    timeout: Duration,
) -> ShareResult<Vec<PeerAddress>> {
    let deadline = tokio::time::Instant::now() + timeout;

    let nonce = uuid::Uuid::new_v4().to_string();
    let probe = encode_packet(&DiscoveryMsg::Probe {
        nonce: nonce.clone(),
    })
    .ok_or_else(|| ShareError::Protocol("cannot encode discovery probe".to_string()))?;

    // The wildcard socket is required; a broadcast from it leaves through one
    // interface only, so multi-homed hosts also probe from each interface.
    let mut sockets = vec![(
        bind_probe_socket(SocketAddr::from(([0, 0, 0, 0], 0))).await?,
        targets.to_vec(),
    )];
    // A loopback target answered via an interface address would be seen twice
    let lan_targets: Vec<SocketAddr> = targets
        .iter()
        .copied()
        .filter(|t| !t.ip().is_loopback())
        .collect();
    if !lan_targets.is_empty() {
        for addr in interface_bind_addrs(local_interfaces()) {
            match bind_probe_socket(addr).await {
                Ok(socket) => sockets.push((socket, lan_targets.clone())),
                Err(e) => debug!("Not probing from {}: {}", addr, e),
            }
        }
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(64);
    let mut readers = JoinSet::new();
    for (socket, targets) in sockets {
        for target in &targets {
            if let Err(e) = socket.send_to(&probe, target).await {
                // e.g. broadcast not permitted on this interface; other targets may still work
                debug!("Failed to send discovery probe to {}: {}", target, e);
            }
        }
        readers.spawn(read_replies(socket, reply_tx.clone()));
    }
    drop(reply_tx);

    let mut peers: Vec<PeerAddress> = Vec::new();
    loop {
        let (packet, from) = match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
            Ok(Some(reply)) => reply,
            // Every reader gave up; nothing more can arrive
            Ok(None) => break,
            Err(_) => break,
        };

        match decode_packet(&packet) {
            Some(DiscoveryMsg::Announce {
                nonce: reply_nonce,
                server_name,
                port,
            }) if reply_nonce == nonce => {
                let peer = PeerAddress::new(SocketAddr::new(from.ip(), port));
                if !peers.contains(&peer) {
                    info!("Found server '{}' at {}", server_name, peer);
                    peers.push(peer);
                }
            }
            _ => debug!("Ignoring datagram from {}", from),
        }
    }

    readers.abort_all();
    Ok(peers)
}

async fn bind_probe_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Every interface address of this host, loopback included
fn local_interfaces() -> Vec<(String, IpAddr)> {
    local_ip_address::list_afinet_netifas().unwrap_or_else(|e| {
        debug!("Cannot enumerate interfaces: {}", e);
        Vec::new()
    })
}

/// One probe socket per distinct usable IPv4 interface address.
pub fn interface_bind_addrs(interfaces: Vec<(String, IpAddr)>) -> Vec<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    for (_name, ip) in interfaces {
        let IpAddr::V4(v4) = ip else {
            continue;
        };
        if v4.is_loopback() || v4.is_unspecified() || v4.is_link_local() {
            continue;
        }
        let addr = SocketAddr::new(ip, 0);
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    addrs
}

/// Forward datagrams from one probe socket until the channel closes or the
/// socket keeps failing.
async fn read_replies(socket: UdpSocket, tx: mpsc::Sender<(Vec<u8>, SocketAddr)>) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut backoff = RecvBackoff::default();
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                backoff.reset();
                if tx.send((buf[..len].to_vec(), from)).await.is_err() {
                    return;
                }
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    debug!("Discovery receive error: {}", e);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("Giving up on discovery socket after repeated errors: {}", e);
                    return;
                }
            },
        }
    }
}

/// Paces retries after receive errors and gives up on a socket that never
/// recovers.
#[derive(Debug, Default)]
struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    const MAX_FAILURES: u32 = 8;
    const BASE_DELAY: Duration = Duration::from_millis(10);

    fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > Self::MAX_FAILURES {
            return None;
        }
        Some(Self::BASE_DELAY * 2u32.pow(self.failures.min(5) - 1))
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}
