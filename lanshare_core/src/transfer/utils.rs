use crate::ShareEvent;
use crate::transfer::constants::{MAX_FILENAME_LENGTH, PROGRESS_STEP};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::sync::mpsc;

/// Check that a requested name is one plain entry of the root.
///
/// Separators, `.`/`..` and NUL never reach the filesystem.
pub fn validate_request_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err("name too long");
    }
    if name == "." || name == ".." {
        return Err("relative component");
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("path separator in name");
    }
    Ok(())
}

/// Turn a server-supplied name into something safe to create locally
pub fn sanitize_file_name(file_name: &str) -> String {
    // Take the last component of either separator style
    let file_name = file_name
        .split(['/', '\\'])
        .next_back()
        .unwrap_or("unknown_file");

    let mut clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    // See: https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|&r| clean_name.eq_ignore_ascii_case(r))
    {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        let mut cutoff = MAX_FILENAME_LENGTH;
        while !clean_name.is_char_boundary(cutoff) {
            cutoff -= 1;
        }
        clean_name.truncate(cutoff);
    }

    clean_name
}

/// `name`, then `stem (1).ext`, `stem (2).ext`, ...
pub fn collision_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        // A leading dot is a hidden file, not an extension
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], attempt, &name[idx..]),
        _ => format!("{} ({})", name, attempt),
    }
}

/// Create a new file in `dir` named after `name` without touching any
/// existing file. Returns the path actually used.
pub async fn create_unique_file(dir: &Path, name: &str) -> std::io::Result<(PathBuf, File)> {
    const MAX_ATTEMPTS: u32 = 1000;

    for attempt in 0..MAX_ATTEMPTS {
        let path = dir.join(collision_name(name, attempt));
        match open_secure_file(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", name, dir.display()),
    ))
}

/// Create a fresh file with owner-only permissions (0o600 on Unix)
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Best-effort progress reporting for one transfer.
///
/// Uses `try_send` so a slow or absent listener never stalls the data path.
pub struct ProgressReporter {
    event_tx: Option<mpsc::Sender<ShareEvent>>,
    file_name: String,
    total_bytes: u64,
    start_time: Instant,
    last_reported: u64,
}

impl ProgressReporter {
    pub fn new(event_tx: Option<mpsc::Sender<ShareEvent>>, file_name: &str, total: u64) -> Self {
        Self {
            event_tx,
            file_name: file_name.to_string(),
            total_bytes: total,
            start_time: Instant::now(),
            last_reported: 0,
        }
    }

    /// Total becomes known once the server answers
    pub fn set_total(&mut self, total: u64) {
        self.total_bytes = total;
    }

    pub fn update(&mut self, bytes_done: u64) {
        if bytes_done != self.total_bytes && bytes_done - self.last_reported < PROGRESS_STEP {
            return;
        }
        self.last_reported = bytes_done;
        let speed = format_transfer_speed(bytes_done, self.start_time.elapsed().as_secs_f64());
        self.emit(ShareEvent::TransferProgress {
            file_name: self.file_name.clone(),
            bytes_done,
            total_bytes: self.total_bytes,
            speed,
        });
    }

    pub fn completed(&self) {
        self.emit(ShareEvent::TransferCompleted {
            file_name: self.file_name.clone(),
        });
    }

    pub fn failed(&self, reason: &str) {
        self.emit(ShareEvent::TransferFailed {
            file_name: self.file_name.clone(),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: ShareEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Counts transfers currently holding an open file handle.
#[derive(Debug, Clone, Default)]
pub struct TransferGauge {
    active: Arc<AtomicUsize>,
}

impl TransferGauge {
    pub fn enter(&self) -> TransferGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        TransferGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Decrements the gauge when the transfer (and its file handle) goes away
pub struct TransferGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
