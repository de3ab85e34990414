use crate::error::{ShareError, ShareResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::constants::BUFFER_SIZE;
use super::protocol::{ControlMsg, recv_msg};
use super::utils::ProgressReporter;

/// Read the answer to a `FileRequest` and stream the payload into `sink`.
///
/// Returns the number of bytes written. Only `BUFFER_SIZE` bytes are held in
/// memory at a time.
pub async fn receive_file<R, W>(
    recv: &mut R,
    sink: &mut W,
    name: &str,
    progress: &mut ProgressReporter,
) -> ShareResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let size = match recv_msg(recv).await.map_err(into_transfer_error)? {
        ControlMsg::FileFound { size } => size,
        ControlMsg::FileNotFound => return Err(ShareError::NotFound(name.to_string())),
        ControlMsg::FileIsFolder => return Err(ShareError::IsFolder(name.to_string())),
        ControlMsg::TransferError { message } => return Err(ShareError::Transfer(message)),
        other => {
            return Err(ShareError::Protocol(format!(
                "Expected file response, got {:?}",
                other
            )));
        }
    };
    debug!("Receiving {} ({} bytes)", name, size);
    progress.set_total(size);

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut received: u64 = 0;

    while received < size {
        let to_read = std::cmp::min(BUFFER_SIZE as u64, size - received) as usize;
        let n = recv
            .read(&mut buffer[..to_read])
            .await
            .map_err(|e| ShareError::Transfer(e.to_string()))?;
        if n == 0 {
            return Err(ShareError::Transfer(format!(
                "stream ended after {} of {} bytes",
                received, size
            )));
        }
        sink.write_all(&buffer[..n]).await?;
        hasher.update(&buffer[..n]);
        received += n as u64;
        progress.update(received);
    }
    sink.flush().await?;

    match recv_msg(recv).await.map_err(into_transfer_error)? {
        ControlMsg::TransferComplete { hash } => {
            let actual = hasher.finalize().to_hex().to_string();
            if actual != hash {
                return Err(ShareError::Transfer(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    name, hash, actual
                )));
            }
        }
        other => {
            return Err(ShareError::Protocol(format!(
                "Expected TransferComplete, got {:?}",
                other
            )));
        }
    }

    Ok(received)
}

/// Stream-level failures mid-transfer are transfer errors to the caller
fn into_transfer_error(e: ShareError) -> ShareError {
    match e {
        ShareError::Io(io) => ShareError::Transfer(io.to_string()),
        other => other,
    }
}
