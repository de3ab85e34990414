mod common;

use lanshare_core::{Client, SessionState, ShareError, ShareEvent};
use std::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BIG: usize = 8 * 1024 * 1024;

#[tokio::test]
async fn test_download_file_saves_content() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("a.txt"), b"0123456789").unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let saved = client
        .download_file("a.txt", None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(saved, downloads.path().join("a.txt"));
    assert_eq!(fs::read(&saved).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_download_never_overwrites() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("a.txt"), b"from server").unwrap();
    let downloads = tempfile::tempdir().unwrap();
    fs::write(downloads.path().join("a.txt"), b"mine").unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let cancel = CancellationToken::new();
    let first = client.download_file("a.txt", None, &cancel).await.unwrap();
    let second = client.download_file("a.txt", None, &cancel).await.unwrap();

    assert_eq!(first, downloads.path().join("a (1).txt"));
    assert_eq!(second, downloads.path().join("a (2).txt"));
    assert_eq!(fs::read(downloads.path().join("a.txt")).unwrap(), b"mine");
    assert_eq!(fs::read(&first).unwrap(), b"from server");
    assert_eq!(fs::read(&second).unwrap(), b"from server");
}

#[tokio::test]
async fn test_missing_file_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("listed.txt"), b"x").unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    // Listed, then deleted before the request
    let catalog = client.fetch_catalog().await.unwrap();
    assert!(catalog.get("listed.txt").is_some());
    fs::remove_file(root.path().join("listed.txt")).unwrap();

    let err = client
        .download_file("listed.txt", None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ShareError::NotFound(ref n) if n == "listed.txt"), "{:?}", err);
    assert!(err.is_stale_catalog());
    assert_eq!(fs::read_dir(downloads.path()).unwrap().count(), 0);
    // A failed request does not end the session
    assert_eq!(client.current_state(), SessionState::Connected);
}

#[tokio::test]
async fn test_folder_request_is_folder_error() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("docs")).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    assert!(matches!(
        client.request_file("docs").await,
        Err(ShareError::IsFolder(_))
    ));
    assert!(matches!(
        client
            .download_file("docs", None, &CancellationToken::new())
            .await,
        Err(ShareError::IsFolder(_))
    ));
    assert_eq!(fs::read_dir(downloads.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_names_cannot_escape_root() {
    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("share");
    fs::create_dir(&root).unwrap();
    fs::write(outer.path().join("secret.txt"), b"private").unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(&root, downloads.path()).await;

    for name in ["../secret.txt", "..", "/etc/hostname", "share/../secret.txt"] {
        let result = client.request_file(name).await;
        assert!(matches!(result, Err(ShareError::NotFound(_))), "{}: {:?}", name, result);
    }
}

#[tokio::test]
async fn test_unlisted_name_still_served() {
    let root = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    // Never fetched a catalog; created after connecting
    fs::write(root.path().join("fresh.txt"), b"fresh").unwrap();
    assert_eq!(client.request_file("fresh.txt").await.unwrap(), b"fresh");
}

#[tokio::test]
async fn test_empty_file_downloads() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("empty"), b"").unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let saved = client
        .download_file("empty", None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fs::metadata(saved).unwrap().len(), 0);
}

#[tokio::test]
async fn test_large_download_matches_source() {
    let root = tempfile::tempdir().unwrap();
    let content = common::patterned_bytes(3 * 1024 * 1024 + 17, 7);
    fs::write(root.path().join("big.bin"), &content).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let saved = client
        .download_file("big.bin", Some(other.path()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(saved, other.path().join("big.bin"));
    assert!(fs::read(&saved).unwrap() == content);
    assert_eq!(fs::read_dir(downloads.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_content() {
    let root = tempfile::tempdir().unwrap();
    let first = common::patterned_bytes(1024 * 1024, 1);
    let second = common::patterned_bytes(1024 * 1024 + 5, 2);
    fs::write(root.path().join("one.bin"), &first).unwrap();
    fs::write(root.path().join("two.bin"), &second).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (_server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let (one, two) = tokio::join!(client.request_file("one.bin"), client.request_file("two.bin"));

    assert!(one.unwrap() == first);
    assert!(two.unwrap() == second);
}

#[tokio::test]
async fn test_cancel_releases_server_handle() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("big.bin"), common::patterned_bytes(BIG, 3)).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (server, client) = common::connected_pair(root.path(), downloads.path()).await;

    // Nobody reads the other end, so the transfer stalls mid-file
    let (mut sink, _reader) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(
        client.request_file_to("big.bin", &mut sink, &cancel),
        async {
            common::wait_for(|| server.active_transfers() == 1).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(ShareError::Transfer(_))), "{:?}", result);
    common::wait_for(|| server.active_transfers() == 0).await;

    // The session is still usable
    assert_eq!(client.current_state(), SessionState::Connected);
    fs::write(root.path().join("small.txt"), b"still here").unwrap();
    assert_eq!(client.request_file("small.txt").await.unwrap(), b"still here");
}

#[tokio::test]
async fn test_cancelled_download_removes_partial_file() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("big.bin"), common::patterned_bytes(BIG, 4)).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = client.download_file("big.bin", None, &cancel).await;

    assert!(matches!(result, Err(ShareError::Transfer(_))), "{:?}", result);
    assert_eq!(fs::read_dir(downloads.path()).unwrap().count(), 0);
    common::wait_for(|| server.active_transfers() == 0).await;
}

#[tokio::test]
async fn test_dropped_request_releases_server_handle() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("big.bin"), common::patterned_bytes(BIG, 5)).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (server, client) = common::connected_pair(root.path(), downloads.path()).await;

    let (mut sink, _reader) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();
    tokio::select! {
        _ = client.request_file_to("big.bin", &mut sink, &cancel) => panic!("Transfer should stall"),
        _ = common::wait_for(|| server.active_transfers() == 1) => {}
    }

    // The request future is gone, taking its stream with it
    common::wait_for(|| server.active_transfers() == 0).await;
}

#[tokio::test]
async fn test_root_change_does_not_disturb_running_transfer() {
    let first_root = tempfile::tempdir().unwrap();
    let second_root = tempfile::tempdir().unwrap();
    let content = common::patterned_bytes(BIG, 6);
    fs::write(first_root.path().join("big.bin"), &content).unwrap();
    fs::write(second_root.path().join("other.txt"), b"other").unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (server, client) = common::connected_pair(first_root.path(), downloads.path()).await;

    let (mut sink, mut reader) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();

    let (result, (entries, received)) = tokio::join!(
        client.request_file_to("big.bin", &mut sink, &cancel),
        async {
            common::wait_for(|| server.active_transfers() == 1).await;
            server.select_root(second_root.path()).await.unwrap();
            let entries = server.list_entries().await.unwrap();

            let mut received = vec![0u8; content.len()];
            reader.read_exact(&mut received).await.unwrap();
            (entries, received)
        }
    );

    assert_eq!(result.unwrap(), content.len() as u64);
    assert!(received == content);
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["other.txt"]);

    // New requests resolve against the new root
    assert!(matches!(
        client.request_file("big.bin").await,
        Err(ShareError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_progress_and_completion_events() {
    let root = tempfile::tempdir().unwrap();
    let content = common::patterned_bytes(2 * 1024 * 1024, 8);
    fs::write(root.path().join("big.bin"), &content).unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let server = common::start_server(root.path()).await;

    let (tx, mut rx) = mpsc::channel(1024);
    let client = Client::with_events(common::options_for(&server, downloads.path()), tx).unwrap();
    client
        .connect(server.local_addr().unwrap().into())
        .await
        .unwrap();

    client
        .download_file("big.bin", None, &CancellationToken::new())
        .await
        .unwrap();
    let _ = client.request_file("missing.txt").await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let last_progress = events
        .iter()
        .filter_map(|e| match e {
            ShareEvent::TransferProgress {
                bytes_done,
                total_bytes,
                ..
            } => Some((*bytes_done, *total_bytes)),
            _ => None,
        })
        .last();
    let total = content.len() as u64;
    assert_eq!(last_progress, Some((total, total)));

    assert!(events.contains(&ShareEvent::TransferCompleted {
        file_name: "big.bin".to_string()
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        ShareEvent::TransferFailed { file_name, .. } if file_name == "missing.txt"
    )));
}

#[tokio::test]
async fn test_unsendable_request_is_transfer_failure() {
    let root = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let server = common::start_server(root.path()).await;

    let (tx, mut rx) = mpsc::channel(64);
    let client = Client::with_events(common::options_for(&server, downloads.path()), tx).unwrap();
    client
        .connect(server.local_addr().unwrap().into())
        .await
        .unwrap();

    // Too large for one control frame
    let name = "n".repeat(100_000);
    let result = client.request_file(&name).await;
    assert!(matches!(result, Err(ShareError::Transfer(_))), "{:?}", result);

    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        if let ShareEvent::TransferFailed { file_name, .. } = event {
            failed |= file_name == name;
        }
    }
    assert!(failed, "No TransferFailed event for the request");
    assert_eq!(client.current_state(), SessionState::Connected);
}
