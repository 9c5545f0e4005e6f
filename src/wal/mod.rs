// Write-Ahead Log
//
// Append-only record log with CRC32-framed records, explicit flush
// control, and positional reads. LSNs are byte offsets into the log
// stream: `append` returns both the offset where the record begins (the
// key by which it can be re-read) and the offset just past it (the point
// durability must reach before the record's effects may be advertised).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::common::Lsn;
use crate::error::{DbError, Result};

/// Frame header: record length (u32) + kind tag (u8) + CRC32 (u32).
const FRAME_HEADER_LEN: u64 = 9;

/// Kinds of records the two-phase core writes to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordKind {
    /// Full prepare-state payload for a transaction entering prepared state.
    XactPrepare,
    /// Coordinator decided COMMIT for a prepared transaction.
    XactCommitPrepared,
    /// Coordinator decided ROLLBACK for a prepared transaction.
    XactAbortPrepared,
    /// Checkpoint record carrying the prepared-transaction pointers.
    Checkpoint,
}

impl WalRecordKind {
    fn as_u8(self) -> u8 {
        match self {
            WalRecordKind::XactPrepare => 1,
            WalRecordKind::XactCommitPrepared => 2,
            WalRecordKind::XactAbortPrepared => 3,
            WalRecordKind::Checkpoint => 4,
        }
    }

    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(WalRecordKind::XactPrepare),
            2 => Some(WalRecordKind::XactCommitPrepared),
            3 => Some(WalRecordKind::XactAbortPrepared),
            4 => Some(WalRecordKind::Checkpoint),
            _ => None,
        }
    }
}

/// A record as stored in (or read back from) the log.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub body: Vec<u8>,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Number of replication senders to wake after each flush of a
    /// transaction-control record. Zero disables wakeups entirely.
    pub max_wal_senders: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self { max_wal_senders: 0 }
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalStats {
    pub records_written: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
}

struct WalWriter {
    file: BufWriter<File>,
    /// Offset at which the next record will begin.
    next_lsn: Lsn,
}

type SyncRepHook = Box<dyn Fn(Lsn) + Send + Sync>;

/// Write-ahead log manager.
///
/// A single writer appends; readers open their own handles and read by
/// offset. Reads force the write buffer down to the OS first so that a
/// record is readable as soon as `append` returns, even before fsync.
pub struct WalManager {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    flushed_lsn: AtomicU64,
    /// Records below this offset have been handed to log trimming and may
    /// no longer be read.
    truncated_below: AtomicU64,
    sender_wakeups: AtomicU64,
    sync_rep_hook: RwLock<Option<SyncRepHook>>,
    config: WalConfig,
    stats: RwLock<WalStats>,
}

impl WalManager {
    /// Opens (or creates) the log at `path`. On reopen the append position
    /// resumes at the current end of file.
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let next_lsn = file.metadata()?.len();

        Ok(Self {
            path,
            writer: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                next_lsn,
            }),
            flushed_lsn: AtomicU64::new(next_lsn),
            truncated_below: AtomicU64::new(0),
            sender_wakeups: AtomicU64::new(0),
            sync_rep_hook: RwLock::new(None),
            config,
            stats: RwLock::new(WalStats::default()),
        })
    }

    /// Appends a record and returns `(begin_lsn, end_lsn)`. The record is
    /// buffered; call [`flush`](Self::flush) to make it durable.
    pub fn append(&self, kind: WalRecordKind, body: &[u8]) -> Result<(Lsn, Lsn)> {
        let mut writer = self.writer.lock();
        let begin = writer.next_lsn;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind.as_u8()]);
        hasher.update(body);
        let crc = hasher.finalize();

        writer.file.write_all(&(body.len() as u32).to_le_bytes())?;
        writer.file.write_all(&[kind.as_u8()])?;
        writer.file.write_all(&crc.to_le_bytes())?;
        writer.file.write_all(body)?;

        let end = begin + FRAME_HEADER_LEN + body.len() as u64;
        writer.next_lsn = end;

        let mut stats = self.stats.write();
        stats.records_written += 1;
        stats.bytes_written += FRAME_HEADER_LEN + body.len() as u64;

        Ok((begin, end))
    }

    /// Flushes and fsyncs the log at least up to `lsn`.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.flushed_lsn.load(Ordering::SeqCst) >= lsn {
            return Ok(());
        }
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        self.flushed_lsn.store(writer.next_lsn, Ordering::SeqCst);
        self.stats.write().fsyncs += 1;
        Ok(())
    }

    /// Offset durably on disk.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// Offset at which the next record will be written.
    pub fn current_lsn(&self) -> Lsn {
        self.writer.lock().next_lsn
    }

    /// Reads the record beginning exactly at `begin_lsn`.
    ///
    /// Returns the record and the offset just past it. A missing, torn, or
    /// checksum-failing record is reported as corruption; callers decide
    /// how loud to be about it.
    pub fn read_record(&self, begin_lsn: Lsn) -> Result<(WalRecord, Lsn)> {
        if begin_lsn < self.truncated_below.load(Ordering::SeqCst) {
            return Err(DbError::Wal(format!(
                "record at {} is below the truncation horizon",
                begin_lsn
            )));
        }
        self.sync_buffer_to_os()?;

        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if begin_lsn + FRAME_HEADER_LEN > len {
            return Err(DbError::Corruption(format!(
                "no record at log position {}",
                begin_lsn
            )));
        }
        file.seek(SeekFrom::Start(begin_lsn))?;
        Self::read_frame(&mut file, begin_lsn, len)?.ok_or_else(|| {
            DbError::Corruption(format!("torn record at log position {}", begin_lsn))
        })
    }

    /// Returns `(begin, record, end)` for every readable record at or
    /// after `start`, stopping cleanly at a torn tail.
    pub fn records_from(&self, start: Lsn) -> Result<Vec<(Lsn, WalRecord, Lsn)>> {
        self.sync_buffer_to_os()?;

        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let mut offset = start.max(self.truncated_below.load(Ordering::SeqCst));
        file.seek(SeekFrom::Start(offset))?;

        let mut out = Vec::new();
        while offset + FRAME_HEADER_LEN <= len {
            match Self::read_frame(&mut file, offset, len)? {
                Some((record, end)) => {
                    out.push((offset, record, end));
                    offset = end;
                }
                // A torn tail means the final append never completed; replay
                // stops here and the tail is overwritten by new records.
                None => break,
            }
        }
        Ok(out)
    }

    /// Reads one frame at `begin`; `Ok(None)` means the frame extends past
    /// the end of the file (a torn final write).
    fn read_frame(
        file: &mut File,
        begin: Lsn,
        file_len: u64,
    ) -> Result<Option<(WalRecord, Lsn)>> {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let kind_tag = header[4];
        let stored_crc = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

        if begin + FRAME_HEADER_LEN + body_len > file_len {
            return Ok(None);
        }

        let kind = WalRecordKind::from_u8(kind_tag).ok_or_else(|| {
            DbError::Corruption(format!(
                "unknown record kind {} at log position {}",
                kind_tag, begin
            ))
        })?;

        let mut body = vec![0u8; body_len as usize];
        file.read_exact(&mut body)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind_tag]);
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            return Err(DbError::Corruption(format!(
                "checksum mismatch at log position {}",
                begin
            )));
        }

        Ok(Some((
            WalRecord { kind, body },
            begin + FRAME_HEADER_LEN + body_len,
        )))
    }

    /// Pushes buffered writes to the OS without fsync, so readers observe
    /// everything appended so far.
    fn sync_buffer_to_os(&self) -> Result<()> {
        self.writer.lock().file.flush()?;
        Ok(())
    }

    /// Marks everything below `horizon` as trimmed. Callers must first
    /// bound the horizon by the oldest prepare LSN still referenced by a
    /// resident prepared transaction.
    pub fn truncate_before(&self, horizon: Lsn) {
        self.truncated_below.fetch_max(horizon, Ordering::SeqCst);
    }

    pub fn truncation_horizon(&self) -> Lsn {
        self.truncated_below.load(Ordering::SeqCst)
    }

    /// Wakes replication senders, if any are configured.
    pub fn wake_senders(&self) {
        if self.config.max_wal_senders > 0 {
            self.sender_wakeups.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn sender_wakeups(&self) -> u64 {
        self.sender_wakeups.load(Ordering::SeqCst)
    }

    /// Installs the synchronous-replication waiter invoked after each
    /// durable transaction-control write.
    pub fn set_sync_rep_hook(&self, hook: SyncRepHook) {
        *self.sync_rep_hook.write() = Some(hook);
    }

    /// Blocks until synchronous standbys confirm `lsn`, when configured.
    pub fn sync_rep_wait(&self, lsn: Lsn) {
        if let Some(hook) = self.sync_rep_hook.read().as_ref() {
            hook(lsn);
        }
    }

    pub fn stats(&self) -> WalStats {
        self.stats.read().clone()
    }
}
