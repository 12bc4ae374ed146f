//! Cooperative cancellation: global stop plus per-item abort and pause.
//!
//! Markers live under the state directory so `foreman stop|abort|resume` can
//! reach a daemon running in another process; the in-process flag covers
//! Ctrl-C. Checking a signal never changes anything.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const STOP_MARKER: &str = "STOP";
const ABORT_DIR: &str = "abort";
const PAUSE_DIR: &str = "pause";

#[derive(Debug, Clone)]
pub struct SignalStore {
    dir: PathBuf,
    stop: Arc<AtomicBool>,
}

impl SignalStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.to_path_buf(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the in-process stop flag (signal handlers).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Write the stop marker for a daemon in another process.
    pub fn write_stop(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(STOP_MARKER), "")
    }

    /// Drop a leftover stop marker from a previous run.
    pub fn clear_stop(&self) -> io::Result<()> {
        remove_if_exists(&self.dir.join(STOP_MARKER))
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.dir.join(STOP_MARKER).exists()
    }

    fn marker(&self, kind: &str, item: u64) -> PathBuf {
        self.dir.join(kind).join(item.to_string())
    }

    fn write_marker(&self, kind: &str, item: u64, reason: &str) -> io::Result<()> {
        let path = self.marker(kind, item);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, reason)
    }

    pub fn abort(&self, item: u64) -> io::Result<()> {
        self.write_marker(ABORT_DIR, item, "")
    }

    pub fn aborted(&self, item: u64) -> bool {
        self.marker(ABORT_DIR, item).exists()
    }

    pub fn clear_abort(&self, item: u64) -> io::Result<()> {
        remove_if_exists(&self.marker(ABORT_DIR, item))
    }

    /// Park an item: the daemon will not dispatch it until resumed.
    pub fn pause(&self, item: u64, reason: &str) -> io::Result<()> {
        self.write_marker(PAUSE_DIR, item, reason)
    }

    pub fn paused(&self, item: u64) -> bool {
        self.marker(PAUSE_DIR, item).exists()
    }

    /// Clear both pause and abort markers for an item.
    pub fn resume(&self, item: u64) -> io::Result<()> {
        remove_if_exists(&self.marker(PAUSE_DIR, item))?;
        self.clear_abort(item)
    }

    pub fn paused_items(&self) -> Vec<u64> {
        let Ok(entries) = std::fs::read_dir(self.dir.join(PAUSE_DIR)) else {
            return Vec::new();
        };
        let mut items: Vec<u64> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect();
        items.sort_unstable();
        items
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_via_flag_or_marker() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalStore::new(dir.path());
        assert!(!signals.stop_requested());

        signals.write_stop().unwrap();
        assert!(signals.stop_requested());
        signals.clear_stop().unwrap();
        assert!(!signals.stop_requested());

        signals.clone().request_stop();
        assert!(signals.stop_requested());
    }

    #[test]
    fn abort_is_item_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalStore::new(dir.path());
        signals.abort(4).unwrap();
        assert!(signals.aborted(4));
        assert!(!signals.aborted(5));
        assert!(!signals.stop_requested());
    }

    #[test]
    fn resume_clears_pause_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalStore::new(dir.path());
        signals.pause(9, "stalled").unwrap();
        signals.pause(2, "stalled").unwrap();
        signals.abort(9).unwrap();
        assert_eq!(signals.paused_items(), vec![2, 9]);

        signals.resume(9).unwrap();
        assert!(!signals.paused(9));
        assert!(!signals.aborted(9));
        assert_eq!(signals.paused_items(), vec![2]);
    }

    #[test]
    fn clearing_missing_markers_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalStore::new(dir.path());
        signals.clear_stop().unwrap();
        signals.resume(1).unwrap();
    }
}
