use crate::catalog::DirectoryEntry;
use crate::error::{ShareError, ShareResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::MAX_MSG_SIZE;

/// Control messages. Every exchange runs on its own bidirectional stream:
/// the client writes one request, the server answers and finishes the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMsg {
    Hello {
        protocol_version: u32,
        client_name: String,
    },
    Welcome {
        protocol_version: u32,
        server_name: String,
    },
    Rejected {
        message: String,
    },
    CatalogRequest,
    /// Followed by exactly `count` `CatalogEntry` frames, in listing order
    CatalogHeader {
        root: PathBuf,
        count: u64,
    },
    CatalogEntry {
        entry: DirectoryEntry,
    },
    CatalogUnavailable {
        root: PathBuf,
        message: String,
    },
    FileRequest {
        name: String,
    },
    /// Followed by exactly `size` raw bytes, then `TransferComplete`
    FileFound {
        size: u64,
    },
    FileNotFound,
    FileIsFolder,
    TransferError {
        message: String,
    },
    /// BLAKE3 hex digest of the payload just sent
    TransferComplete {
        hash: String,
    },
}

/// Send a length-prefixed control message
pub async fn send_msg<W>(send: &mut W, msg: &ControlMsg) -> ShareResult<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(msg).map_err(|e| ShareError::Protocol(e.to_string()))?;
    if json.len() > MAX_MSG_SIZE {
        return Err(ShareError::Protocol(format!(
            "Message too large: {} bytes (max {})",
            json.len(),
            MAX_MSG_SIZE
        )));
    }
    let len = (json.len() as u32).to_be_bytes();
    send.write_all(&len).await?;
    send.write_all(&json).await?;
    Ok(())
}

/// Receive a length-prefixed control message
pub async fn recv_msg<R>(recv: &mut R) -> ShareResult<ControlMsg>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    // Check before allocating
    if len > MAX_MSG_SIZE {
        return Err(ShareError::Protocol(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_MSG_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| ShareError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::constants::MAX_FILENAME_LENGTH;

    #[tokio::test]
    async fn test_messages_keep_their_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        send_msg(&mut a, &ControlMsg::FileRequest { name: "a.txt".into() })
            .await
            .unwrap();
        send_msg(&mut a, &ControlMsg::FileIsFolder).await.unwrap();

        assert_eq!(
            recv_msg(&mut b).await.unwrap(),
            ControlMsg::FileRequest { name: "a.txt".into() }
        );
        assert_eq!(recv_msg(&mut b).await.unwrap(), ControlMsg::FileIsFolder);
    }

    #[tokio::test]
    async fn test_catalog_records_keep_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let entries = vec![DirectoryEntry::folder("docs"), DirectoryEntry::file("readme.txt")];

        send_msg(
            &mut a,
            &ControlMsg::CatalogHeader {
                root: PathBuf::from("/srv/share"),
                count: entries.len() as u64,
            },
        )
        .await
        .unwrap();
        for entry in &entries {
            send_msg(&mut a, &ControlMsg::CatalogEntry { entry: entry.clone() })
                .await
                .unwrap();
        }

        assert_eq!(
            recv_msg(&mut b).await.unwrap(),
            ControlMsg::CatalogHeader {
                root: PathBuf::from("/srv/share"),
                count: 2
            }
        );
        for expected in entries {
            assert_eq!(
                recv_msg(&mut b).await.unwrap(),
                ControlMsg::CatalogEntry { entry: expected }
            );
        }
    }

    #[tokio::test]
    async fn test_longest_entry_fits_one_frame() {
        // Worst case: every byte of a maximal name escapes to \u00XX
        let name = "\u{1}".repeat(MAX_FILENAME_LENGTH);
        let mut out = Vec::new();
        send_msg(
            &mut out,
            &ControlMsg::CatalogEntry {
                entry: DirectoryEntry::file(name),
            },
        )
        .await
        .unwrap();
        assert!(out.len() <= MAX_MSG_SIZE + 4);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bad_len = (MAX_MSG_SIZE as u32 + 1000).to_be_bytes();
        a.write_all(&bad_len).await.unwrap();

        let err = recv_msg(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("Message too large"), "{}", err);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"Fi").await.unwrap();
        drop(a);

        assert!(matches!(recv_msg(&mut b).await, Err(ShareError::Io(_))));
    }
}
