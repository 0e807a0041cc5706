//! On-disk recovery log
//!
//! Every durable index update is appended as one framed record. At startup
//! the log is read back front to back to rebuild the index; a torn or
//! corrupt record ends the replay and the file is cut back to the last good
//! record before new appends.
//!
//! Record format:
//! ```text
//! +--------+------+-----------+----------+--------+------+--------+
//! | Magic  | Kind | Lsn first | Lsn last | Length | Data | CRC32C |
//! | 4B     | 1B   | 8B        | 8B       | 4B     | var  | 4B     |
//! +--------+------+-----------+----------+--------+------+--------+
//! ```
//!
//! Entry payloads are bincode-encoded [`IndexUpdate`]s.

use crate::index::IndexUpdate;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vdisk_common::{Error, Lsn, LsnSeg, Result};

/// Record magic number
const RECORD_MAGIC: u32 = 0x5652_4C52; // "VRLR"

/// Record header size (magic + kind + first + last + length)
const RECORD_HEADER_SIZE: usize = 25;

const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// An index update
    Entry = 1,
    /// Clean shutdown marker carrying the last lsn written
    Checkpoint = 2,
}

impl RecordKind {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Entry),
            2 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// When appends reach the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every appended batch
    Always,
    /// Leave flushing to the OS (tests, scratch nodes)
    Never,
}

fn u32_at(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn u64_at(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub seg: LsnSeg,
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Entry record for an index update
    pub fn entry(seg: LsnSeg, update: &IndexUpdate) -> Result<Self> {
        let data = bincode::serialize(update).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self {
            kind: RecordKind::Entry,
            seg,
            data,
        })
    }

    #[must_use]
    pub const fn checkpoint(lsn: Lsn) -> Self {
        Self {
            kind: RecordKind::Checkpoint,
            seg: LsnSeg::point(lsn),
            data: Vec::new(),
        }
    }

    /// Decode the payload of an entry record
    pub fn update(&self) -> Result<IndexUpdate> {
        bincode::deserialize(&self.data).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Serialize the record to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.seg.first.to_le_bytes());
        buf.extend_from_slice(&self.seg.last.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);

        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse one record from the front of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE + CRC_SIZE {
            return Err(Error::storage("log record too small"));
        }
        if u32_at(data, 0) != RECORD_MAGIC {
            return Err(Error::storage("invalid log record magic"));
        }
        let kind = RecordKind::from_u8(data[4]).ok_or_else(|| Error::storage("invalid log record kind"))?;
        let first = u64_at(data, 5);
        let last = u64_at(data, 13);
        if first > last {
            return Err(Error::storage(format!("invalid lsn range [{first}, {last}]")));
        }
        let data_len = u32_at(data, 21) as usize;

        let body_end = RECORD_HEADER_SIZE + data_len;
        if data.len() < body_end + CRC_SIZE {
            return Err(Error::storage("log record data truncated"));
        }
        let expected = u32_at(data, body_end);
        let actual = crc32c::crc32c(&data[..body_end]);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            kind,
            seg: LsnSeg::new(first, last),
            data: data[RECORD_HEADER_SIZE..body_end].to_vec(),
        })
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.data.len() + CRC_SIZE
    }
}

/// Everything read back from an existing log
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<(IndexUpdate, LsnSeg)>,
    /// Highest lsn found in any valid record
    pub last_lsn: Lsn,
    /// Whether the log ended with a clean-shutdown checkpoint
    pub clean: bool,
}

/// Append-only recovery log file
pub struct RecoveryLog {
    path: PathBuf,
    file: Mutex<File>,
    sync_mode: SyncMode,
}

impl RecoveryLog {
    /// Open (creating if absent) the log at `path` and replay it. A torn
    /// tail is cut off so appends continue after the last good record.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<(Self, Replay)> {
        let path = path.as_ref().to_path_buf();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut replay = Replay::default();
        let mut offset = 0;
        while offset < bytes.len() {
            let record = match LogRecord::from_bytes(&bytes[offset..]) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "recovery log ends with a bad record");
                    break;
                }
            };
            match record.kind {
                RecordKind::Entry => {
                    let update = match record.update() {
                        Ok(update) => update,
                        Err(e) => {
                            warn!(path = %path.display(), offset, error = %e, "undecodable log entry");
                            break;
                        }
                    };
                    replay.entries.push((update, record.seg));
                    replay.clean = false;
                }
                RecordKind::Checkpoint => replay.clean = true,
            }
            replay.last_lsn = replay.last_lsn.max(record.seg.last);
            offset += record.serialized_size();
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if offset < bytes.len() {
            file.set_len(offset as u64)?;
        }
        debug!(
            path = %path.display(),
            entries = replay.entries.len(),
            last_lsn = replay.last_lsn,
            "recovery log opened"
        );

        Ok((
            Self {
                path,
                file: Mutex::new(file),
                sync_mode,
            },
            replay,
        ))
    }

    /// Append a batch of records, syncing once at the end per the sync mode
    pub fn append(&self, records: &[LogRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(records.iter().map(LogRecord::serialized_size).sum());
        for record in records {
            buf.extend_from_slice(&record.to_bytes());
        }

        let mut file = self.file.lock();
        file.write_all(&buf)?;
        if self.sync_mode == SyncMode::Always {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Write a checkpoint marker and sync
    pub fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        self.append(&[LogRecord::checkpoint(lsn)])?;
        self.sync()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
