//! Store configuration and backend-mode selection.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{JunctionError, Result};

/// Default per-record payload cap (and history-rollover threshold): 16 MB
pub const DEFAULT_WRITE_BUFFER_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Which backend the session store is wired to.
///
/// Only the file backend lives in this crate; the others are selected here
/// but implemented by external store crates behind the same contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Append-only log file on local disk
    File,
    /// Relational database
    Db,
    /// Redis
    Redis,
    /// Raft-replicated log
    Raft,
}

impl StoreMode {
    /// Resolve a mode from its configured name, case-insensitively.
    ///
    /// Unknown names are a startup-fatal error: the coordinator must not
    /// come up with a backend it cannot identify.
    pub fn get(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file" => Ok(StoreMode::File),
            "db" => Ok(StoreMode::Db),
            "redis" => Ok(StoreMode::Redis),
            "raft" => Ok(StoreMode::Raft),
            _ => Err(JunctionError::UnknownStoreMode(name.to_string())),
        }
    }

    /// Whether `name` identifies any known store mode
    pub fn contains(name: &str) -> bool {
        Self::get(name).is_ok()
    }

    /// Configuration name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::File => "file",
            StoreMode::Db => "db",
            StoreMode::Redis => "redis",
            StoreMode::Raft => "raft",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreMode {
    type Err = JunctionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::get(s)
    }
}

/// Session store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Selected backend
    pub mode: StoreMode,
    /// Directory holding the session log files
    pub dir: PathBuf,
    /// Active log file name (the rolled history file adds a `.his` suffix)
    pub file_name: String,
    /// Hard cap on a single encoded record payload; oversized payloads are
    /// rejected at write time, never truncated
    pub file_write_buffer_cache_size: usize,
    /// Active-file size beyond which the log is rolled into the history file
    pub max_file_size: u64,
    /// Cadence of the background timeout sweep
    pub timeout_check_interval: Duration,
    /// Whether the background timeout scanner thread is started
    pub scanner_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::File,
            dir: PathBuf::from("."),
            file_name: "sessions.data".to_string(),
            file_write_buffer_cache_size: DEFAULT_WRITE_BUFFER_CACHE_SIZE,
            max_file_size: DEFAULT_WRITE_BUFFER_CACHE_SIZE as u64,
            timeout_check_interval: Duration::from_secs(5),
            scanner_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_mode_case_insensitive() {
        assert_eq!(StoreMode::get("file").unwrap(), StoreMode::File);
        assert_eq!(StoreMode::get("FILE").unwrap(), StoreMode::File);
        assert_eq!(StoreMode::get("Db").unwrap(), StoreMode::Db);
        assert_eq!(StoreMode::get("rEdIs").unwrap(), StoreMode::Redis);
        assert_eq!(StoreMode::get("raft").unwrap(), StoreMode::Raft);
    }

    #[test]
    fn test_store_mode_unknown_is_fatal() {
        let err = StoreMode::get("zookeeper").unwrap_err();
        match err {
            JunctionError::UnknownStoreMode(name) => assert_eq!(name, "zookeeper"),
            other => panic!("expected UnknownStoreMode, got {other:?}"),
        }
        assert!(!StoreMode::contains("zookeeper"));
        assert!(StoreMode::contains("Redis"));
    }

    #[test]
    fn test_store_mode_from_str() {
        let mode: StoreMode = "File".parse().unwrap();
        assert_eq!(mode, StoreMode::File);
        assert_eq!(mode.to_string(), "file");
    }
}
