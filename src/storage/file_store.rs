//! File-backed transaction store: an append-only session log.
//!
//! On-disk framing, per record:
//! ```text
//! [4 bytes BE payload length][payload][4 bytes BE crc32(payload)]
//! ```
//! The payload is the record codec's `[op][session body]`. A crash can only
//! truncate the tail; replay stops cleanly at the first incomplete or
//! corrupt frame instead of parsing garbage.
//!
//! Two on-disk artifacts: the active log and a rolled `.his` file. Rollover
//! re-anchors every still-live session into the active log, then swaps by
//! rename, so either the pre- or post-rollover pair is fully valid after a
//! crash at any point.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::config::StoreConfig;
use crate::session::global::now_millis;
use crate::session::SessionManager;
use crate::storage::record::{SessionPayload, TransactionWriteStore};
use crate::storage::{LogOperation, TransactionStoreManager};
use crate::{JunctionError, Result};

/// BufWriter capacity for the append path
const WRITE_BUFFER_SIZE: usize = 64 * 1024;
/// Bytes of framing around each payload (length prefix + crc)
const FRAME_OVERHEAD: u64 = 8;

struct LogWriter {
    file: BufWriter<File>,
    size: u64,
}

#[derive(Default)]
struct ReadCursors {
    current: u64,
    history: u64,
}

/// Append-only file store for session log records
pub struct FileTransactionStoreManager {
    curr_path: PathBuf,
    his_path: PathBuf,
    writer: Mutex<LogWriter>,
    cursors: Mutex<ReadCursors>,
    /// Back-reference for the timeout sweep and history rollover; weak so
    /// the manager→store ownership stays acyclic
    session_manager: RwLock<Option<Weak<SessionManager>>>,
    /// Hard cap on one framed payload
    buffer_cap: usize,
    /// Active-file size that arms a rollover
    max_file_size: u64,
    /// Set when the active file outgrows `max_file_size`; the background
    /// sweep performs the actual rollover so no caller-held session lock
    /// can deadlock against the checkpoint pass
    needs_roll: AtomicBool,
    /// Held exclusively for the lifetime of this manager
    _lock_file: File,
}

impl FileTransactionStoreManager {
    /// Open (or create) the session log under `config.dir`.
    ///
    /// Takes an exclusive advisory lock so a second coordinator process
    /// cannot append to the same store. Does not replay: recovery is the
    /// session manager's job.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let curr_path = config.dir.join(&config.file_name);
        let his_path = config.dir.join(format!("{}.his", config.file_name));

        let lock_path = config.dir.join(format!("{}.lock", config.file_name));
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            JunctionError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("session store {} is locked by another process", curr_path.display()),
            ))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&curr_path)?;
        let size = Self::recover_append_position(&file, &curr_path, config.file_write_buffer_cache_size)?;

        Ok(Self {
            curr_path,
            his_path,
            writer: Mutex::new(LogWriter {
                file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
                size,
            }),
            cursors: Mutex::new(ReadCursors::default()),
            session_manager: RwLock::new(None),
            buffer_cap: config.file_write_buffer_cache_size,
            max_file_size: config.max_file_size,
            needs_roll: AtomicBool::new(false),
            _lock_file: lock_file,
        })
    }

    /// Walk the frame chain and drop any crash-truncated or corrupt tail,
    /// so new appends land at a boundary replay can actually reach. No
    /// record is decoded here; this is framing recovery only.
    fn recover_append_position(file: &File, path: &Path, buffer_cap: usize) -> Result<u64> {
        let file_len = file.metadata()?.len();
        let mut reader = io::BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;

        let mut valid_end = 0u64;
        loop {
            let remaining = file_len - valid_end;
            if remaining < FRAME_OVERHEAD {
                break;
            }
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as u64;
            if len == 0 || len as usize > buffer_cap || remaining < FRAME_OVERHEAD + len {
                break;
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            let mut crc_buf = [0u8; 4];
            reader.read_exact(&mut crc_buf)?;
            if u32::from_be_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            valid_end += FRAME_OVERHEAD + len;
        }

        if valid_end < file_len {
            log::warn!(
                "dropping {} bytes of incomplete tail from {}",
                file_len - valid_end,
                path.display()
            );
            file.set_len(valid_end)?;
        }
        Ok(valid_end)
    }

    /// Attach the session manager consulted by the timeout sweep and the
    /// rollover checkpoint pass.
    pub fn attach_session_manager(&self, manager: &std::sync::Arc<SessionManager>) {
        *self.session_manager.write() = Some(std::sync::Arc::downgrade(manager));
    }

    fn attached_manager(&self) -> Option<std::sync::Arc<SessionManager>> {
        self.session_manager.read().as_ref().and_then(Weak::upgrade)
    }

    /// Frame and append one encoded payload, flushing and syncing before
    /// returning so the record is durable when the caller mutates memory.
    fn append_encoded(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.buffer_cap {
            return Err(JunctionError::PayloadTooLarge {
                size: payload.len(),
                limit: self.buffer_cap,
            });
        }
        let crc = crc32fast::hash(payload);

        let mut writer = self.writer.lock();
        writer.file.write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.file.write_all(payload)?;
        writer.file.write_all(&crc.to_be_bytes())?;
        writer.file.flush()?;
        writer.file.get_ref().sync_data()?;
        writer.size += payload.len() as u64 + FRAME_OVERHEAD;

        if writer.size > self.max_file_size {
            self.needs_roll.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Checkpoint one session (global record plus one record per branch)
    /// into the active log. Caller holds the session's lock, so the status
    /// seen here is the status persisted.
    fn checkpoint_session(&self, session: &crate::session::GlobalSession) -> Result<()> {
        let global = TransactionWriteStore::new(
            LogOperation::GlobalAdd,
            SessionPayload::Global(session.clone_header()),
        )
        .encode()?;
        self.append_encoded(&global)?;
        for branch in &session.branch_sessions {
            let record = TransactionWriteStore::new(
                LogOperation::BranchAdd,
                SessionPayload::Branch(branch.clone()),
            )
            .encode()?;
            self.append_encoded(&record)?;
        }
        Ok(())
    }

    /// Timeout sweep body: durably re-write every globally timed-out,
    /// still-live session as a fresh checkpoint in the active log.
    ///
    /// Per-session encode problems are logged and skipped; only an
    /// unrecoverable I/O failure aborts the sweep. Returns whether any
    /// checkpoint was written.
    pub fn find_timeout_and_save(&self) -> Result<bool> {
        let Some(manager) = self.attached_manager() else {
            return Ok(false);
        };
        let now = now_millis();
        let mut wrote = false;
        for handle in manager.timed_out_handles(now) {
            let session = handle.lock();
            // Re-validate under the session lock: a session that reached a
            // terminal status since the scan must not be checkpointed.
            if !session.is_timed_out(now) {
                continue;
            }
            match self.checkpoint_session(&session) {
                Ok(()) => wrote = true,
                Err(JunctionError::Io(e)) => return Err(JunctionError::Io(e)),
                Err(e) => {
                    log::warn!(
                        "skipping timeout checkpoint for global session {}: {e}",
                        session.xid
                    );
                }
            }
        }
        if self.needs_roll.load(Ordering::SeqCst) {
            self.save_history()?;
        }
        Ok(wrote)
    }

    /// Roll the active log into the history file.
    ///
    /// The swap happens first (rename, then a fresh active file), and every
    /// still-live session is then re-anchored into the new active log. Once
    /// the checkpoint pass completes, the history file is fully redundant
    /// and the next rollover may discard it. A crash mid-pass leaves the
    /// renamed file intact, so replaying history-then-active still sees
    /// every record.
    pub fn save_history(&self) -> Result<()> {
        let Some(manager) = self.attached_manager() else {
            // Without the index there is nothing to re-anchor; rolling now
            // would make the next rollover lossy.
            return Ok(());
        };

        {
            let mut writer = self.writer.lock();
            writer.file.flush()?;
            writer.file.get_ref().sync_all()?;
            std::fs::rename(&self.curr_path, &self.his_path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.curr_path)?;
            *writer = LogWriter {
                file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
                size: 0,
            };
        }
        {
            let mut cursors = self.cursors.lock();
            cursors.current = 0;
            cursors.history = 0;
        }

        for handle in manager.session_handles() {
            let session = handle.lock();
            if session.status.is_terminal() {
                continue;
            }
            match self.checkpoint_session(&session) {
                Ok(()) => {}
                Err(JunctionError::Io(e)) => return Err(JunctionError::Io(e)),
                Err(e) => {
                    log::warn!(
                        "skipping rollover checkpoint for global session {}: {e}",
                        session.xid
                    );
                }
            }
        }

        self.needs_roll.store(false, Ordering::SeqCst);
        log::info!("session log rolled into {}", self.his_path.display());
        Ok(())
    }

    /// Whether a rollover is pending (active file outgrew its threshold)
    pub fn rollover_pending(&self) -> bool {
        self.needs_roll.load(Ordering::SeqCst)
    }

    fn read_path(&self, is_history: bool) -> &Path {
        if is_history {
            &self.his_path
        } else {
            &self.curr_path
        }
    }

    /// Read up to `read_size` complete records starting at the cursor,
    /// advancing the cursor past each fully verified record. Stops at the
    /// first incomplete or corrupt frame (the crash-truncated tail).
    fn read_batch(&self, read_size: usize, is_history: bool) -> Result<Vec<TransactionWriteStore>> {
        let path = self.read_path(is_history);
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();

        let mut cursors = self.cursors.lock();
        let mut offset = if is_history { cursors.history } else { cursors.current };
        file.seek(SeekFrom::Start(offset))?;

        let mut records = Vec::new();
        while records.len() < read_size {
            let remaining = file_len.saturating_sub(offset);
            if remaining < FRAME_OVERHEAD {
                break;
            }

            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as u64;
            if len == 0 || len as usize > self.buffer_cap {
                log::warn!(
                    "corrupt frame length {len} at offset {offset} in {}; treating as end of log",
                    path.display()
                );
                break;
            }
            if remaining < FRAME_OVERHEAD + len {
                log::warn!(
                    "truncated record at offset {offset} in {}; recovering up to last complete record",
                    path.display()
                );
                break;
            }

            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload)?;
            let mut crc_buf = [0u8; 4];
            file.read_exact(&mut crc_buf)?;
            if u32::from_be_bytes(crc_buf) != crc32fast::hash(&payload) {
                log::warn!(
                    "crc mismatch at offset {offset} in {}; treating as end of log",
                    path.display()
                );
                break;
            }

            match TransactionWriteStore::decode(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!(
                        "undecodable record at offset {offset} in {}: {e}; treating as end of log",
                        path.display()
                    );
                    break;
                }
            }
            offset += FRAME_OVERHEAD + len;
        }

        if is_history {
            cursors.history = offset;
        } else {
            cursors.current = offset;
        }
        Ok(records)
    }
}

impl TransactionStoreManager for FileTransactionStoreManager {
    fn write_session(&self, operation: LogOperation, session: &SessionPayload) -> Result<()> {
        let payload = TransactionWriteStore::new(operation, session.clone()).encode()?;
        self.append_encoded(&payload)
    }

    fn read_write_store(
        &self,
        read_size: usize,
        is_history: bool,
    ) -> Result<Vec<TransactionWriteStore>> {
        self.read_batch(read_size, is_history)
    }

    fn has_remaining(&self, is_history: bool) -> bool {
        let offset = {
            let cursors = self.cursors.lock();
            if is_history {
                cursors.history
            } else {
                cursors.current
            }
        };
        std::fs::metadata(self.read_path(is_history))
            .map(|m| m.len() > offset)
            .unwrap_or(false)
    }

    fn shutdown(&self) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.file.flush().and_then(|_| writer.file.get_ref().sync_all()) {
            log::error!("flush on session store shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BranchSession, BranchType, GlobalSession};
    use tempfile::tempdir;

    fn store_config(dir: &Path) -> StoreConfig {
        StoreConfig {
            dir: dir.to_path_buf(),
            ..StoreConfig::default()
        }
    }

    fn branch_record(global: &GlobalSession, branch_id: u64, fill: u8, size: usize) -> SessionPayload {
        SessionPayload::Branch(BranchSession::new(
            global.xid.clone(),
            global.transaction_id,
            branch_id,
            "jdbc:mysql://db1/orders",
            BranchType::At,
            "",
            "rm-client-1",
            vec![fill; size],
        ))
    }

    #[test]
    fn test_write_then_read_in_order() {
        let dir = tempdir().unwrap();
        let store = FileTransactionStoreManager::new(&store_config(dir.path())).unwrap();

        let global = GlobalSession::begin("app", "group", "name", 60_000);
        store
            .write_session(LogOperation::GlobalAdd, &SessionPayload::Global(global.clone()))
            .unwrap();
        store
            .write_session(LogOperation::BranchAdd, &branch_record(&global, 1, b'x', 16))
            .unwrap();

        let records = store.read_write_store(2000, false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, LogOperation::GlobalAdd);
        assert_eq!(records[1].operation, LogOperation::BranchAdd);

        // The cursor advanced past everything read
        assert!(store.read_write_store(2000, false).unwrap().is_empty());
        assert!(!store.has_remaining(false));
    }

    #[test]
    fn test_big_data_write() {
        let dir = tempdir().unwrap();
        let store = FileTransactionStoreManager::new(&store_config(dir.path())).unwrap();
        let global = GlobalSession::begin("app", "group", "name", 60_000);

        let ten_mb = 10 * 1024 * 1024;
        store
            .write_session(LogOperation::BranchAdd, &branch_record(&global, 1, b'A', ten_mb))
            .unwrap();
        store
            .write_session(LogOperation::BranchAdd, &branch_record(&global, 2, b'B', ten_mb))
            .unwrap();

        let records = store.read_write_store(2000, false).unwrap();
        assert_eq!(records.len(), 2);
        for (record, fill) in records.iter().zip([b'A', b'B']) {
            match &record.session {
                SessionPayload::Branch(b) => {
                    assert_eq!(b.application_data.len(), ten_mb);
                    assert!(b.application_data.iter().all(|&byte| byte == fill));
                }
                other => panic!("expected branch record, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = tempdir().unwrap();
        let mut config = store_config(dir.path());
        config.file_write_buffer_cache_size = 1024;
        let store = FileTransactionStoreManager::new(&config).unwrap();

        let global = GlobalSession::begin("app", "group", "name", 60_000);
        let err = store
            .write_session(LogOperation::BranchAdd, &branch_record(&global, 1, b'A', 2048))
            .unwrap_err();
        assert!(matches!(err, JunctionError::PayloadTooLarge { .. }));

        // Nothing was written: the log is still empty
        assert!(store.read_write_store(2000, false).unwrap().is_empty());
    }

    #[test]
    fn test_payload_exactly_at_cap_is_accepted() {
        let dir = tempdir().unwrap();
        let global = GlobalSession::begin("app", "group", "name", 60_000);
        let record = branch_record(&global, 1, b'A', 4096);
        let encoded_len = TransactionWriteStore::new(LogOperation::BranchAdd, record.clone())
            .encode()
            .unwrap()
            .len();

        let mut config = store_config(dir.path());
        config.file_write_buffer_cache_size = encoded_len;
        {
            let store = FileTransactionStoreManager::new(&config).unwrap();
            store.write_session(LogOperation::BranchAdd, &record).unwrap();
            assert_eq!(store.read_write_store(2000, false).unwrap().len(), 1);
        }

        // One byte under the cap tips the same record over the limit
        config.file_write_buffer_cache_size = encoded_len - 1;
        let store = FileTransactionStoreManager::new(&config).unwrap();
        let err = store.write_session(LogOperation::BranchAdd, &record).unwrap_err();
        assert!(matches!(err, JunctionError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_truncated_tail_is_tolerated() {
        let dir = tempdir().unwrap();
        let config = store_config(dir.path());
        let path = config.dir.join(&config.file_name);

        let global = GlobalSession::begin("app", "group", "name", 60_000);
        {
            let store = FileTransactionStoreManager::new(&config).unwrap();
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, 1, b'a', 64))
                .unwrap();
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, 2, b'b', 64))
                .unwrap();
            store.shutdown();
        }

        // Cut the file in the middle of the second record
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 20).unwrap();
        drop(file);

        let store = FileTransactionStoreManager::new(&config).unwrap();
        let records = store.read_write_store(2000, false).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].session {
            SessionPayload::Branch(b) => assert_eq!(b.branch_id, 1),
            other => panic!("expected branch record, got {other:?}"),
        }

        // The torn tail was dropped on open, so new appends stay reachable
        store
            .write_session(LogOperation::BranchAdd, &branch_record(&global, 3, b'c', 64))
            .unwrap();
        let records = store.read_write_store(2000, false).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].session {
            SessionPayload::Branch(b) => assert_eq!(b.branch_id, 3),
            other => panic!("expected branch record, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = tempdir().unwrap();
        let config = store_config(dir.path());
        let path = config.dir.join(&config.file_name);

        let global = GlobalSession::begin("app", "group", "name", 60_000);
        let first_record_end;
        {
            let store = FileTransactionStoreManager::new(&config).unwrap();
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, 1, b'a', 64))
                .unwrap();
            first_record_end = std::fs::metadata(&path).unwrap().len();
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, 2, b'b', 64))
                .unwrap();
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, 3, b'c', 64))
                .unwrap();
            store.shutdown();
        }

        // Flip one payload byte inside the second record
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first_record_end + 12)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let store = FileTransactionStoreManager::new(&config).unwrap();
        let records = store.read_write_store(2000, false).unwrap();
        // Replay stops at the corrupt record; the third record is not
        // reachable past it
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_second_process_is_locked_out() {
        let dir = tempdir().unwrap();
        let config = store_config(dir.path());
        let _store = FileTransactionStoreManager::new(&config).unwrap();
        // The advisory lock is per file handle, so a second manager over the
        // same store directory must be refused even in-process
        assert!(FileTransactionStoreManager::new(&config).is_err());
    }

    #[test]
    fn test_rollover_armed_when_file_outgrows_threshold() {
        let dir = tempdir().unwrap();
        let mut config = store_config(dir.path());
        config.max_file_size = 256;
        let store = FileTransactionStoreManager::new(&config).unwrap();

        let global = GlobalSession::begin("app", "group", "name", 60_000);
        assert!(!store.rollover_pending());
        for id in 0..4 {
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, id, b'x', 64))
                .unwrap();
        }
        assert!(store.rollover_pending());
        // Without an attached session manager nothing can be re-anchored,
        // so the roll is deferred rather than performed lossily
        store.save_history().unwrap();
        assert!(!dir.path().join("sessions.data.his").exists());
    }

    #[test]
    fn test_batched_cursor_reads() {
        let dir = tempdir().unwrap();
        let store = FileTransactionStoreManager::new(&store_config(dir.path())).unwrap();
        let global = GlobalSession::begin("app", "group", "name", 60_000);
        for id in 0..10 {
            store
                .write_session(LogOperation::BranchAdd, &branch_record(&global, id, b'x', 8))
                .unwrap();
        }

        let mut seen = 0;
        loop {
            let batch = store.read_write_store(3, false).unwrap();
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() <= 3);
            seen += batch.len();
        }
        assert_eq!(seen, 10);
    }
}
