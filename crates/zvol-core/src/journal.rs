//! File-backed intent journal
//!
//! An [`IntentLog`] that appends write and truncate intents to a file.
//! Records carry a CRC32C; recovery stops at the first record that fails
//! to decode or verify and truncates the torn tail.
//!
//! File layout:
//!
//! ```text
//! header:  magic u64 | version u32 | sequence u64 | checkpoint u64
//! record:  sequence u64 | type u8 | txg u64 | offset u64 | length u64
//!          | data_len u32 | data | crc32c u32
//! ```
//!
//! A checkpoint record means every record with a lower sequence has been
//! applied to the store. Replay feeds the records after the last checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{IntentLog, LogRecord};
use crate::error::{BlockError, BlockResult};

/// Magic number for journal file header
const JOURNAL_MAGIC: u64 = 0x5A56_4F4C_5F49_4C47; // "ZVOL_ILG"

/// Journal file version
const JOURNAL_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: u64 = 8 + 4 + 8 + 8;

/// Default size after which a clean close rotates the file
pub const DEFAULT_JOURNAL_MAX_SIZE: u64 = 64 * 1024 * 1024;

fn journal_io(err: std::io::Error) -> BlockError {
    BlockError::Journal(err.to_string())
}

/// Journal record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Data written at an offset
    Write = 1,
    /// Range freed
    Truncate = 2,
    /// All prior records are applied
    Checkpoint = 3,
}

impl TryFrom<u8> for EntryType {
    type Error = BlockError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Write),
            2 => Ok(Self::Truncate),
            3 => Ok(Self::Checkpoint),
            _ => Err(BlockError::Journal(format!("invalid entry type: {value}"))),
        }
    }
}

/// One journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Sequence number, assigned on append
    pub sequence: u64,
    pub entry_type: EntryType,
    /// Transaction group the intent belongs to
    pub txg: u64,
    pub offset: u64,
    pub length: u64,
    /// Payload, write records only
    pub data: Option<Bytes>,
    pub checksum: u32,
}

impl JournalEntry {
    fn new(entry_type: EntryType, txg: u64, offset: u64, length: u64, data: Option<Bytes>) -> Self {
        Self {
            sequence: 0,
            entry_type,
            txg,
            offset,
            length,
            data,
            checksum: 0,
        }
    }

    /// Write intent
    pub fn write(txg: u64, offset: u64, data: Bytes) -> Self {
        let length = data.len() as u64;
        Self::new(EntryType::Write, txg, offset, length, Some(data))
    }

    /// Truncate intent
    pub fn truncate(txg: u64, offset: u64, length: u64) -> Self {
        Self::new(EntryType::Truncate, txg, offset, length, None)
    }

    /// Checkpoint marker
    pub fn checkpoint() -> Self {
        Self::new(EntryType::Checkpoint, 0, 0, 0, None)
    }

    /// Assign the sequence number and compute the checksum
    fn seal(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.checksum = self.compute_checksum();
    }

    fn compute_checksum(&self) -> u32 {
        let mut buf = Vec::with_capacity(33);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.push(self.entry_type as u8);
        buf.extend_from_slice(&self.txg.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        let crc = crc32c::crc32c(&buf);
        match &self.data {
            Some(data) => crc32c::crc32c_append(crc, data),
            None => crc,
        }
    }

    /// Verify checksum
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Serialize to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let data_len = self.data.as_ref().map_or(0, Bytes::len);
        let mut buf = Vec::with_capacity(45 + data_len);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.push(self.entry_type as u8);
        buf.extend_from_slice(&self.txg.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&(data_len as u32).to_le_bytes());
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize from reader
    pub fn deserialize<R: Read>(reader: &mut R) -> BlockResult<Self> {
        let sequence = read_u64(reader)?;
        let mut type_buf = [0u8; 1];
        reader.read_exact(&mut type_buf).map_err(journal_io)?;
        let entry_type = EntryType::try_from(type_buf[0])?;
        let txg = read_u64(reader)?;
        let offset = read_u64(reader)?;
        let length = read_u64(reader)?;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).map_err(journal_io)?;
        let data_len = u32::from_le_bytes(len_buf) as usize;
        let data = if entry_type == EntryType::Write {
            let mut data_buf = vec![0u8; data_len];
            reader.read_exact(&mut data_buf).map_err(journal_io)?;
            Some(Bytes::from(data_buf))
        } else if data_len == 0 {
            None
        } else {
            return Err(BlockError::Journal(format!(
                "{entry_type:?} record with {data_len} payload bytes"
            )));
        };

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf).map_err(journal_io)?;

        Ok(Self {
            sequence,
            entry_type,
            txg,
            offset,
            length,
            data,
            checksum: u32::from_le_bytes(crc_buf),
        })
    }

    fn into_record(self) -> Option<LogRecord> {
        match self.entry_type {
            EntryType::Write => Some(LogRecord::Write {
                offset: self.offset,
                data: self.data.unwrap_or_default(),
            }),
            EntryType::Truncate => Some(LogRecord::Truncate {
                offset: self.offset,
                length: self.length,
            }),
            EntryType::Checkpoint => None,
        }
    }
}

fn read_u64<R: Read>(reader: &mut R) -> BlockResult<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(journal_io)?;
    Ok(u64::from_le_bytes(buf))
}

/// What a scan of an existing journal found
struct ScanResult {
    next_sequence: u64,
    last_checkpoint: u64,
    pending: Vec<JournalEntry>,
    valid_len: u64,
}

/// Intent journal stored in a single file
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    /// Next sequence number to assign
    sequence: AtomicU64,
    /// Records up to and including this sequence are applied
    last_checkpoint: AtomicU64,
    /// Records appended since the last checkpoint
    pending: AtomicU64,
    max_size: u64,
    current_size: AtomicU64,
    sync_mode: AtomicBool,
    commits: AtomicU64,
}

impl FileJournal {
    /// Create or open a journal with the default rotation size
    pub fn open<P: AsRef<Path>>(path: P) -> BlockResult<Self> {
        Self::open_with_max_size(path, DEFAULT_JOURNAL_MAX_SIZE)
    }

    /// Create or open a journal at the given path
    pub fn open_with_max_size<P: AsRef<Path>>(path: P, max_size: u64) -> BlockResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BlockError::Journal(format!("failed to create journal dir: {e}")))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BlockError::Journal(format!("failed to open journal: {e}")))?;

        let file_len = file
            .metadata()
            .map_err(|e| BlockError::Journal(format!("failed to stat journal: {e}")))?
            .len();

        let (sequence, last_checkpoint, pending, size) = if file_len == 0 {
            Self::write_header(&mut file, 1, 0)?;
            (1, 0, 0, HEADER_SIZE)
        } else {
            let scan = Self::scan(&file)?;
            if scan.valid_len < file_len {
                warn!(
                    "Journal {:?} has a torn tail, truncating {} bytes",
                    path,
                    file_len - scan.valid_len
                );
                file.set_len(scan.valid_len)
                    .map_err(|e| BlockError::Journal(format!("failed to truncate: {e}")))?;
            }
            (
                scan.next_sequence,
                scan.last_checkpoint,
                scan.pending.len() as u64,
                scan.valid_len,
            )
        };

        file.seek(SeekFrom::End(0))
            .map_err(|e| BlockError::Journal(format!("failed to seek: {e}")))?;

        info!(
            "Opened journal at {:?}: seq={}, checkpoint={}, pending={}, size={}",
            path, sequence, last_checkpoint, pending, size
        );

        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            sequence: AtomicU64::new(sequence),
            last_checkpoint: AtomicU64::new(last_checkpoint),
            pending: AtomicU64::new(pending),
            max_size,
            current_size: AtomicU64::new(size),
            sync_mode: AtomicBool::new(false),
            commits: AtomicU64::new(0),
        })
    }

    fn write_header<W: Write>(writer: &mut W, sequence: u64, checkpoint: u64) -> BlockResult<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&checkpoint.to_le_bytes());
        writer
            .write_all(&buf)
            .and_then(|()| writer.flush())
            .map_err(|e| BlockError::Journal(format!("failed to write header: {e}")))
    }

    fn read_header<R: Read>(reader: &mut R) -> BlockResult<(u64, u64)> {
        let magic = read_u64(reader)?;
        if magic != JOURNAL_MAGIC {
            return Err(BlockError::Journal("invalid journal magic".to_string()));
        }
        let mut version_buf = [0u8; 4];
        reader
            .read_exact(&mut version_buf)
            .map_err(|e| BlockError::Journal(format!("failed to read version: {e}")))?;
        let version = u32::from_le_bytes(version_buf);
        if version != JOURNAL_VERSION {
            return Err(BlockError::Journal(format!(
                "unsupported journal version: {version}"
            )));
        }
        let sequence = read_u64(reader)?;
        let checkpoint = read_u64(reader)?;
        Ok((sequence, checkpoint))
    }

    /// Read every intact record, tracking the last checkpoint
    fn scan(file: &File) -> BlockResult<ScanResult> {
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| BlockError::Journal(format!("failed to seek: {e}")))?;
        let (mut next_sequence, mut last_checkpoint) = Self::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = HEADER_SIZE;
        while let Ok(entry) = JournalEntry::deserialize(&mut reader) {
            if !entry.verify() {
                warn!(
                    "Journal entry {} failed checksum, stopping recovery",
                    entry.sequence
                );
                break;
            }
            valid_len = reader.stream_position().map_err(journal_io)?;
            next_sequence = next_sequence.max(entry.sequence + 1);
            if entry.entry_type == EntryType::Checkpoint {
                last_checkpoint = entry.sequence;
            } else {
                entries.push(entry);
            }
        }

        let pending = entries
            .into_iter()
            .filter(|e| e.sequence > last_checkpoint)
            .collect();
        Ok(ScanResult {
            next_sequence,
            last_checkpoint,
            pending,
            valid_len,
        })
    }

    /// Append a record, assigning its sequence number
    pub fn append(&self, mut entry: JournalEntry) -> BlockResult<u64> {
        let mut writer_guard = self.writer.lock();
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| BlockError::Journal("journal closed".to_string()))?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        entry.seal(seq);
        let data = entry.serialize();
        writer
            .write_all(&data)
            .map_err(|e| BlockError::Journal(format!("write failed: {e}")))?;

        self.current_size
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        if entry.entry_type != EntryType::Checkpoint {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }
        Ok(seq)
    }

    /// Write a checkpoint: everything logged so far is applied
    pub fn checkpoint(&self) -> BlockResult<u64> {
        let seq = self.append(JournalEntry::checkpoint())?;
        self.sync()?;
        self.last_checkpoint.store(seq, Ordering::SeqCst);
        self.pending.store(0, Ordering::SeqCst);
        debug!("Journal checkpoint at sequence {}", seq);
        Ok(seq)
    }

    /// Records after the last checkpoint, in log order
    pub fn recover(&self) -> BlockResult<Vec<JournalEntry>> {
        self.sync()?;
        let file = File::open(&self.path)
            .map_err(|e| BlockError::Journal(format!("failed to open for recovery: {e}")))?;
        let scan = Self::scan(&file)?;
        info!("Recovered {} journal entries", scan.pending.len());
        Ok(scan.pending)
    }

    /// Check if journal needs rotation
    pub fn needs_rotation(&self) -> bool {
        self.current_size.load(Ordering::SeqCst) > self.max_size
    }

    /// Start a fresh file. Only valid right after a checkpoint.
    pub fn rotate(&self) -> BlockResult<()> {
        let mut writer_guard = self.writer.lock();
        *writer_guard = None;

        let old_path = self.path.with_extension("old");
        std::fs::rename(&self.path, &old_path)
            .map_err(|e| BlockError::Journal(format!("failed to rename old journal: {e}")))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| BlockError::Journal(format!("failed to create new journal: {e}")))?;

        let mut writer = BufWriter::new(file);
        let seq = self.sequence.load(Ordering::SeqCst);
        let checkpoint = self.last_checkpoint.load(Ordering::SeqCst);
        Self::write_header(&mut writer, seq, checkpoint)?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| BlockError::Journal(format!("sync failed: {e}")))?;
        *writer_guard = Some(writer);
        drop(writer_guard);

        self.current_size.store(HEADER_SIZE, Ordering::SeqCst);
        if let Err(e) = std::fs::remove_file(&old_path) {
            warn!("Failed to remove old journal: {}", e);
        }

        info!("Rotated journal at sequence {}", seq);
        Ok(())
    }

    /// Flush buffered records and sync them to disk
    pub fn sync(&self) -> BlockResult<()> {
        let mut writer_guard = self.writer.lock();
        if let Some(writer) = writer_guard.as_mut() {
            writer
                .flush()
                .map_err(|e| BlockError::Journal(format!("flush failed: {e}")))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| BlockError::Journal(format!("sync failed: {e}")))?;
        }
        Ok(())
    }

    /// Number of completed commits
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IntentLog for FileJournal {
    fn log_write(&self, txg: u64, offset: u64, data: &Bytes, sync: bool) -> BlockResult<()> {
        self.append(JournalEntry::write(txg, offset, data.clone()))?;
        if sync || self.sync_mode.load(Ordering::SeqCst) {
            self.sync()?;
        }
        Ok(())
    }

    fn log_truncate(&self, txg: u64, offset: u64, length: u64, sync: bool) -> BlockResult<()> {
        self.append(JournalEntry::truncate(txg, offset, length))?;
        if sync || self.sync_mode.load(Ordering::SeqCst) {
            self.sync()?;
        }
        Ok(())
    }

    fn commit(&self) -> BlockResult<()> {
        self.sync()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn async_to_sync(&self) {
        self.sync_mode.store(true, Ordering::SeqCst);
    }

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    fn replay(&self, apply: &mut dyn FnMut(LogRecord) -> BlockResult<()>) -> BlockResult<usize> {
        let entries = self.recover()?;
        let mut applied = 0;
        for record in entries.into_iter().filter_map(JournalEntry::into_record) {
            apply(record)?;
            applied += 1;
        }
        self.checkpoint()?;
        Ok(applied)
    }

    fn discard(&self) -> BlockResult<()> {
        let dropped = self.pending.load(Ordering::SeqCst);
        self.checkpoint()?;
        info!("Discarded {} journal entries from {:?}", dropped, self.path);
        Ok(())
    }

    fn close(&self) -> BlockResult<()> {
        self.checkpoint()?;
        self.sync_mode.store(false, Ordering::SeqCst);
        if self.needs_rotation() {
            self.rotate()?;
        }
        Ok(())
    }
}
