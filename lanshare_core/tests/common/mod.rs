#![allow(dead_code)]

use lanshare_core::{Client, ClientOptions, Server, ServerHandle, ServerOptions, ServerRoot};
use std::path::Path;
use std::time::Duration;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Start a loopback server sharing `root`
pub async fn start_server(root: &Path) -> ServerHandle {
    init_tracing();
    let root = ServerRoot::new(root).await.expect("Root should be valid");
    Server::start(ServerOptions::loopback(), root)
        .await
        .expect("Server should start")
}

/// Client whose probes go straight to `server`'s discovery socket
pub fn client_for(server: &ServerHandle, download_dir: &Path) -> Client {
    Client::new(options_for(server, download_dir)).expect("Client should start")
}

pub fn options_for(server: &ServerHandle, download_dir: &Path) -> ClientOptions {
    ClientOptions {
        probe_targets: vec![server.discovery_addr().unwrap()],
        discovery_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_secs(5),
        download_dir: download_dir.to_path_buf(),
        client_name: "test-client".to_string(),
    }
}

/// Connected client plus the server it talks to
pub async fn connected_pair(root: &Path, download_dir: &Path) -> (ServerHandle, Client) {
    let server = start_server(root).await;
    let client = client_for(&server, download_dir);
    client
        .connect(server.local_addr().unwrap().into())
        .await
        .expect("Should connect");
    (server, client)
}

/// Deterministic content that differs per `seed`
pub fn patterned_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(seed as u32 * 2 + 1).wrapping_add(seed as u32) as u8)
        .collect()
}

/// Poll `cond` every 10ms for up to 5s
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("Condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
