//! Background timeout sweep.
//!
//! Runs on an independent cadence: asks the session manager (through the
//! store) for globally timed-out sessions and durably checkpoints them,
//! which both re-anchors them in the active log segment and keeps the
//! history segment dischargeable. Also performs any pending log rollover,
//! so rollover never runs on a caller's thread holding session locks.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::storage::FileTransactionStoreManager;
use crate::Result;

struct ScannerState {
    stopped: Mutex<bool>,
    signal: Condvar,
}

/// Periodic timeout-sweep thread over a file store
pub struct TimeoutScanner {
    state: Arc<ScannerState>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutScanner {
    /// Spawn the sweep thread; the first sweep runs after one full interval
    pub fn start(store: Arc<FileTransactionStoreManager>, interval: Duration) -> Result<Self> {
        let state = Arc::new(ScannerState {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        });
        let thread_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name("session-timeout-scanner".to_string())
            .spawn(move || loop {
                {
                    let mut stopped = thread_state.stopped.lock();
                    if *stopped {
                        break;
                    }
                    thread_state.signal.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                }
                match store.find_timeout_and_save() {
                    Ok(true) => log::debug!("timeout sweep checkpointed timed-out sessions"),
                    Ok(false) => {}
                    // Sweep failures are surfaced and retried next interval;
                    // the coordinator itself stays up
                    Err(e) => log::error!("timeout sweep failed: {e}"),
                }
            })?;

        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.state.stopped.lock() = true;
        self.state.signal.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("timeout scanner thread panicked");
            }
        }
    }
}

impl Drop for TimeoutScanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::session::global::now_millis;
    use crate::session::{GlobalSession, SessionManager};
    use crate::storage::TransactionStoreManager;
    use tempfile::tempdir;

    #[test]
    fn test_scanner_checkpoints_timed_out_sessions() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let store = Arc::new(FileTransactionStoreManager::new(&config).unwrap());
        let manager = Arc::new(SessionManager::new(store.clone()));
        store.attach_session_manager(&manager);

        let mut session = GlobalSession::begin("app", "group", "name", 60_000);
        session.begin_time = now_millis().saturating_sub(120_000);
        manager.add_global_session(session).unwrap();

        let scanner = TimeoutScanner::start(store.clone(), Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        scanner.stop();

        // The original add plus at least one sweep checkpoint
        let records = store.read_write_store(usize::MAX, false).unwrap();
        assert!(records.len() >= 2, "expected checkpoints, got {}", records.len());
    }

    #[test]
    fn test_scanner_stops_promptly() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let store = Arc::new(FileTransactionStoreManager::new(&config).unwrap());

        let scanner = TimeoutScanner::start(store, Duration::from_secs(3600)).unwrap();
        let started = std::time::Instant::now();
        scanner.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
