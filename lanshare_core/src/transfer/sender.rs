use crate::catalog::ServerRoot;
use anyhow::{Result, bail};
use std::io::ErrorKind;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::constants::BUFFER_SIZE;
use super::protocol::{ControlMsg, send_msg};
use super::utils::{TransferGauge, validate_request_name};

/// Answer one `FileRequest`.
///
/// The name is looked up against the root as it is right now. Once the file
/// is open the transfer keeps its own handle, so a later root change does not
/// affect it. Returns `Ok` for every outcome the client was told about; an
/// `Err` means the stream broke (client cancelled, connection lost) and the
/// caller should reset it.
pub async fn serve_file<W>(
    root: &ServerRoot,
    name: &str,
    send: &mut W,
    gauge: &TransferGauge,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Err(reason) = validate_request_name(name) {
        warn!("Rejected file request {:?}: {}", name, reason);
        send_msg(send, &ControlMsg::FileNotFound).await?;
        return Ok(());
    }

    let root_path = root.current();
    let path = root_path.join(name);

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Requested file {} does not exist", path.display());
            send_msg(send, &ControlMsg::FileNotFound).await?;
            return Ok(());
        }
        Err(e) => {
            send_msg(send, &ControlMsg::TransferError { message: e.to_string() }).await?;
            return Ok(());
        }
    };
    if metadata.is_dir() {
        send_msg(send, &ControlMsg::FileIsFolder).await?;
        return Ok(());
    }

    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            send_msg(send, &ControlMsg::FileNotFound).await?;
            return Ok(());
        }
        Err(e) => {
            send_msg(send, &ControlMsg::TransferError { message: e.to_string() }).await?;
            return Ok(());
        }
    };
    let _guard = gauge.enter();

    // Size comes from the handle we are about to read from
    let size = file.metadata().await?.len();
    send_msg(send, &ControlMsg::FileFound { size }).await?;
    info!("Sending {} ({} bytes)", name, size);

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut sent: u64 = 0;

    while sent < size {
        let to_read = std::cmp::min(BUFFER_SIZE as u64, size - sent) as usize;
        let n = file.read(&mut buffer[..to_read]).await?;
        if n == 0 {
            bail!("{} shrank during transfer ({} of {} bytes)", name, sent, size);
        }
        send.write_all(&buffer[..n]).await?;
        hasher.update(&buffer[..n]);
        sent += n as u64;
    }

    let hash = hasher.finalize().to_hex().to_string();
    send_msg(send, &ControlMsg::TransferComplete { hash }).await?;
    send.flush().await?;

    info!("Sent {} ({} bytes)", name, sent);
    Ok(())
}
