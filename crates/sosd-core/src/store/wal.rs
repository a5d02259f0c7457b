//! Write-ahead log for the value store.
//!
//! Every committed mutation is appended here before it becomes visible.
//! Record layout: `[len: u32 LE][crc32c: u32 LE][JSON payload: len bytes]`.
//! On open the log is replayed; a torn or corrupt tail is reported so the
//! caller can truncate it.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::records::{FieldDef, ValDef};
use crate::types::{Guid, PubInfo};

/// Bytes preceding every payload.
pub const RECORD_HEADER_LEN: u64 = 8;

/// A logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalRecord {
    /// Pub created or its metadata changed; `fields` are newly declared.
    PubUpsert {
        guid: Guid,
        info: PubInfo,
        fields: Vec<FieldDef>,
    },
    /// One publish batch: fields created by it plus all of its values.
    Batch {
        pub_guid: Guid,
        frame: i64,
        fields: Vec<FieldDef>,
        vals: Vec<ValDef>,
    },
}

/// Error type for WAL operations.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub records: Vec<WalRecord>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Why scanning stopped early, if it did.
    pub torn: Option<String>,
}

pub struct WriteAheadLog {
    writer: BufWriter<File>,
    path: PathBuf,
    sync_interval: Duration,
    last_sync: Instant,
    position: u64,
}

impl WriteAheadLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl AsRef<Path>, sync_interval: Duration) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let position = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            sync_interval,
            last_sync: Instant::now(),
            position,
        })
    }

    /// Append a record, syncing when the group-commit interval has passed.
    /// Returns the record's starting position.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        let start = self.position;
        let bytes =
            serde_json::to_vec(record).map_err(|e| WalError::Serialization(e.to_string()))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| WalError::Serialization(format!("record too large: {}", bytes.len())))?;
        let crc = crc32c::crc32c(&bytes);

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&bytes)?;
        self.position += RECORD_HEADER_LEN + bytes.len() as u64;

        if self.sync_interval.is_zero() || self.last_sync.elapsed() >= self.sync_interval {
            self.sync()?;
        } else {
            self.writer.flush()?;
        }
        Ok(start)
    }

    /// Force everything written so far to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Drop everything at and after `position`.
    pub fn truncate(&mut self, position: u64) -> Result<(), WalError> {
        self.writer.flush()?;
        truncate_file(&self.path, position)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.position = position;
        self.sync()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Cut a log file down to `len` bytes.
pub fn truncate_file(path: &Path, len: u64) -> Result<(), WalError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// Read every intact record of the log at `path`.
///
/// A missing file is an empty log. Reading stops at the first record that
/// is incomplete, fails its checksum, or does not decode.
pub fn replay(path: &Path) -> Result<WalReplay, WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(WalReplay::default()),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut out = WalReplay::default();
    let mut position = 0u64;

    loop {
        if position == file_len {
            break;
        }
        let remaining = file_len - position;
        if remaining < RECORD_HEADER_LEN {
            out.torn = Some(format!("incomplete header at offset {position}"));
            break;
        }

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        reader.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if remaining - RECORD_HEADER_LEN < len {
            out.torn = Some(format!(
                "incomplete record at offset {position}: need {len} bytes"
            ));
            break;
        }

        let mut data = vec![0u8; len as usize];
        reader.read_exact(&mut data)?;

        if crc32c::crc32c(&data) != expected_crc {
            out.torn = Some(format!("checksum mismatch at offset {position}"));
            break;
        }

        match serde_json::from_slice::<WalRecord>(&data) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                out.torn = Some(format!("undecodable record at offset {position}: {e}"));
                break;
            }
        }
        position += RECORD_HEADER_LEN + len;
    }

    out.valid_len = position;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Semantic, ValType, Value};
    use tempfile::TempDir;

    fn upsert(guid: Guid) -> WalRecord {
        WalRecord::PubUpsert {
            guid,
            info: PubInfo {
                title: format!("pub-{guid}"),
                ..Default::default()
            },
            fields: vec![FieldDef {
                guid: guid + 100,
                name: "energy".into(),
                val_type: ValType::Double,
                semantic: Semantic::Default,
            }],
        }
    }

    fn batch(pub_guid: Guid, frame: i64) -> WalRecord {
        WalRecord::Batch {
            pub_guid,
            frame,
            fields: Vec::new(),
            vals: vec![ValDef {
                field_guid: pub_guid + 100,
                value: Value::Double(1.5),
                semantic: Semantic::Default,
                time_pack: 1.0,
                time_send: 2.0,
                time_recv: 3.0,
            }],
        }
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("values.wal");
        let mut wal = WriteAheadLog::open(&path, Duration::ZERO).unwrap();

        let first = wal.append(&upsert(1)).unwrap();
        let second = wal.append(&batch(1, 0)).unwrap();
        assert_eq!(first, 0);
        assert!(second > first);

        let replayed = replay(&path).unwrap();
        assert!(replayed.torn.is_none());
        assert_eq!(replayed.records, vec![upsert(1), batch(1, 0)]);
        assert_eq!(replayed.valid_len, wal.position());
    }

    #[test]
    fn test_missing_file_is_empty_log() {
        let tmp = TempDir::new().unwrap();
        let replayed = replay(&tmp.path().join("absent.wal")).unwrap();
        assert!(replayed.records.is_empty());
        assert_eq!(replayed.valid_len, 0);
    }

    #[test]
    fn test_torn_tail_is_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("values.wal");
        let mut wal = WriteAheadLog::open(&path, Duration::ZERO).unwrap();
        wal.append(&upsert(1)).unwrap();
        let good_len = wal.position();
        wal.append(&batch(1, 0)).unwrap();
        drop(wal);

        // Chop the last record in half.
        let full = std::fs::metadata(&path).unwrap().len();
        truncate_file(&path, good_len + (full - good_len) / 2).unwrap();

        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.records, vec![upsert(1)]);
        assert_eq!(replayed.valid_len, good_len);
        assert!(replayed.torn.is_some());
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("values.wal");
        let mut wal = WriteAheadLog::open(&path, Duration::ZERO).unwrap();
        wal.append(&upsert(1)).unwrap();
        let good_len = wal.position();
        wal.append(&upsert(2)).unwrap();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.records.len(), 1);
        assert_eq!(replayed.valid_len, good_len);
        assert!(replayed.torn.unwrap().contains("checksum"));
    }

    #[test]
    fn test_truncate_then_append() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("values.wal");
        let mut wal = WriteAheadLog::open(&path, Duration::from_secs(60)).unwrap();
        wal.append(&upsert(1)).unwrap();
        wal.truncate(0).unwrap();
        wal.append(&upsert(7)).unwrap();
        wal.sync().unwrap();

        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.records, vec![upsert(7)]);
    }
}
