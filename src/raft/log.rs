use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
// Use external log crate, not our own log module
use ::log::{debug, warn};

use super::RaftError;

/// What a log entry carries for the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries of earlier terms.
    Noop,
    Command(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn command(index: u64, term: u64, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            payload: EntryPayload::Command(command),
        }
    }

    pub fn noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            payload: EntryPayload::Noop,
        }
    }
}

/// Ordered, durable sequence of entries indexed from 1.
///
/// Index 0 is a virtual sentinel with term 0, so `term_at(0)` is always
/// `Some(0)` and an empty log has `last_index() == 0`. `append` and
/// `truncate_from` must be durable when they return.
pub trait LogStore: Send {
    /// Appends entries whose indices continue the log contiguously.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError>;

    /// Entries in `[from, to)`, clamped to the log bounds.
    fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, RaftError>;

    /// Removes the entry at `index` and everything after it.
    fn truncate_from(&mut self, index: u64) -> Result<(), RaftError>;

    fn last_index(&self) -> u64;

    fn term_at(&self, index: u64) -> Option<u64>;

    fn last_term(&self) -> u64 {
        self.term_at(self.last_index()).unwrap_or(0)
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>, RaftError> {
        Ok(self.read_range(index, index + 1)?.into_iter().next())
    }
}

fn check_contiguous(last_index: u64, entries: &[LogEntry]) -> Result<(), RaftError> {
    for (i, entry) in entries.iter().enumerate() {
        if entry.index != last_index + 1 + i as u64 {
            return Err(RaftError::InvalidLogIndex(entry.index));
        }
    }
    Ok(())
}

fn slice_range(entries: &[LogEntry], from: u64, to: u64) -> Vec<LogEntry> {
    let from = from.max(1);
    let to = to.min(entries.len() as u64 + 1);
    if from >= to {
        return Vec::new();
    }
    entries[(from - 1) as usize..(to - 1) as usize].to_vec()
}

fn term_in(entries: &[LogEntry], index: u64) -> Option<u64> {
    if index == 0 {
        return Some(0);
    }
    entries.get(index as usize - 1).map(|e| e.term)
}

/// Volatile log for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct MemLogStore {
    entries: Vec<LogEntry>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        check_contiguous(self.last_index(), entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, RaftError> {
        Ok(slice_range(&self.entries, from, to))
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), RaftError> {
        if index < 1 {
            return Err(RaftError::InvalidLogIndex(index));
        }
        self.entries.truncate(index as usize - 1);
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        term_in(&self.entries, index)
    }
}

/// Append-only file of length-prefixed bincode frames at
/// `<data_dir>/raft/log.bin`. Entries are mirrored in memory; every write is
/// followed by `sync_all`.
pub struct FileLogStore {
    entries: Vec<LogEntry>,
    // Byte offset of each entry's frame, parallel to `entries`.
    offsets: Vec<u64>,
    end_offset: u64,
    file: File,
    log_file: PathBuf,
}

impl FileLogStore {
    pub fn open(data_dir: &str) -> Result<Self, RaftError> {
        let log_dir = PathBuf::from(data_dir).join("raft");
        std::fs::create_dir_all(&log_dir)?;
        let log_file = log_dir.join("log.bin");

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_file)?;

        let mut store = Self {
            entries: Vec::new(),
            offsets: Vec::new(),
            end_offset: 0,
            file,
            log_file,
        };
        store.load_from_disk()?;
        Ok(store)
    }

    fn load_from_disk(&mut self) -> Result<(), RaftError> {
        let mut buffer = Vec::new();
        File::open(&self.log_file)?.read_to_end(&mut buffer)?;

        let mut pos = 0usize;
        while pos < buffer.len() {
            let Some((len, decoded)) = read_frame(&buffer[pos..]) else {
                break;
            };
            let entry = match decoded {
                Ok(entry) => entry,
                // A crash can leave a garbage or zero-filled tail behind a full header.
                Err(e) if buffer[pos + len..].iter().all(|b| *b == 0) => {
                    warn!(
                        "Unreadable final frame at offset {pos} in {}: {e}",
                        self.log_file.display()
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            if entry.index != self.entries.len() as u64 + 1 {
                return Err(RaftError::SerializationError(format!(
                    "log file {} is not contiguous at index {}",
                    self.log_file.display(),
                    entry.index
                )));
            }
            self.offsets.push(pos as u64);
            self.entries.push(entry);
            pos += len;
        }
        self.end_offset = pos as u64;

        if pos < buffer.len() {
            warn!(
                "Discarding {} bytes of torn trailing frame in {}",
                buffer.len() - pos,
                self.log_file.display()
            );
            self.file.set_len(pos as u64)?;
            self.file.sync_all()?;
        }

        debug!(
            "Loaded {} log entries from {}",
            self.entries.len(),
            self.log_file.display()
        );
        Ok(())
    }
}

const FRAME_HEADER: usize = 4;

fn encode_frame(entry: &LogEntry, out: &mut Vec<u8>) -> Result<(), RaftError> {
    let body = bincode::encode_to_vec(entry, bincode::config::standard())
        .map_err(|e| RaftError::SerializationError(e.to_string()))?;
    out.extend_from_slice(&frame_len(body.len())?.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

fn frame_len(len: usize) -> Result<u32, RaftError> {
    u32::try_from(len).map_err(|_| {
        RaftError::SerializationError(format!("log entry of {len} bytes exceeds frame limit"))
    })
}

/// Returns the frame length and its decoded entry, or `None` when the buffer
/// holds only part of a frame.
fn read_frame(buf: &[u8]) -> Option<(usize, Result<LogEntry, RaftError>)> {
    if buf.len() < FRAME_HEADER {
        return None;
    }
    let mut header = [0u8; FRAME_HEADER];
    header.copy_from_slice(&buf[..FRAME_HEADER]);
    let len = u32::from_le_bytes(header) as usize;
    if buf.len() < FRAME_HEADER + len {
        return None;
    }
    let decoded = bincode::decode_from_slice::<LogEntry, _>(
        &buf[FRAME_HEADER..FRAME_HEADER + len],
        bincode::config::standard(),
    )
    .map(|(entry, _)| entry)
    .map_err(|e| RaftError::SerializationError(e.to_string()));
    Some((FRAME_HEADER + len, decoded))
}

impl LogStore for FileLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.last_index(), entries)?;

        let mut offset = self.end_offset;
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            let before = buf.len();
            encode_frame(entry, &mut buf)?;
            offsets.push(offset);
            offset += (buf.len() - before) as u64;
        }

        let write = |file: &mut File| -> std::io::Result<()> {
            file.write_all(&buf)?;
            file.sync_all()
        };
        write(&mut self.file)
            .map_err(|e| RaftError::Persistence(format!("appending to log: {e}")))?;

        self.offsets.extend(offsets);
        self.end_offset = offset;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, RaftError> {
        Ok(slice_range(&self.entries, from, to))
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), RaftError> {
        if index < 1 {
            return Err(RaftError::InvalidLogIndex(index));
        }
        if index > self.last_index() {
            return Ok(());
        }

        let cut = self.offsets[index as usize - 1];
        let truncate = |file: &File| -> std::io::Result<()> {
            file.set_len(cut)?;
            file.sync_all()
        };
        truncate(&self.file)
            .map_err(|e| RaftError::Persistence(format!("truncating log: {e}")))?;

        self.entries.truncate(index as usize - 1);
        self.offsets.truncate(index as usize - 1);
        self.end_offset = cut;
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        term_in(&self.entries, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(from: u64, terms: &[u64]) -> Vec<LogEntry> {
        terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry::command(from + i as u64, term, vec![i as u8]))
            .collect()
    }

    #[test]
    fn empty_log_has_sentinel_at_zero() {
        let log = MemLogStore::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn append_rejects_gaps() {
        let mut log = MemLogStore::new();
        log.append(&entries(1, &[1, 1])).expect("append");
        let err = log.append(&entries(4, &[1])).unwrap_err();
        assert!(matches!(err, RaftError::InvalidLogIndex(4)));
    }

    #[test]
    fn read_range_is_half_open_and_clamped() {
        let mut log = MemLogStore::new();
        log.append(&entries(1, &[1, 1, 2, 3])).expect("append");

        let got = log.read_range(2, 4).expect("read");
        assert_eq!(got.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(log.read_range(0, 100).expect("read").len(), 4);
        assert!(log.read_range(5, 10).expect("read").is_empty());
        assert_eq!(log.entry(4).expect("entry").map(|e| e.term), Some(3));
    }

    #[test]
    fn append_and_persist_entries_across_restarts() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_string_lossy().to_string();

        {
            let mut log = FileLogStore::open(&data_dir).expect("open");
            log.append(&entries(1, &[1, 2])).expect("append");
            log.append(&[LogEntry::noop(3, 2)]).expect("append noop");
            assert_eq!(log.last_index(), 3);
        }

        let log = FileLogStore::open(&data_dir).expect("reopen");
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(
            log.entry(3).expect("entry").map(|e| e.payload),
            Some(EntryPayload::Noop)
        );
    }

    #[test]
    fn truncate_discards_entries_on_disk() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_string_lossy().to_string();

        {
            let mut log = FileLogStore::open(&data_dir).expect("open");
            log.append(&entries(1, &[1, 2, 3])).expect("append");
            log.truncate_from(2).expect("truncate");
            assert_eq!(log.last_index(), 1);
            log.append(&entries(2, &[4])).expect("append after truncate");

            let err = log.truncate_from(0).unwrap_err();
            assert!(matches!(err, RaftError::InvalidLogIndex(0)));
        }

        let log = FileLogStore::open(&data_dir).expect("reopen");
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(4));
    }

    #[test]
    fn torn_trailing_frame_is_discarded_on_open() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_string_lossy().to_string();

        {
            let mut log = FileLogStore::open(&data_dir).expect("open");
            log.append(&entries(1, &[1, 1])).expect("append");
        }

        let path = tmp.path().join("raft").join("log.bin");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(&[200, 0, 0, 0, 1, 2]).expect("write torn frame");
        drop(file);

        let mut log = FileLogStore::open(&data_dir).expect("reopen");
        assert_eq!(log.last_index(), 2);
        log.append(&entries(3, &[2])).expect("append after repair");

        let log = FileLogStore::open(&data_dir).expect("reopen again");
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
    }

    fn log_with_two_entries() -> (tempfile::TempDir, String, std::path::PathBuf, u64) {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_string_lossy().to_string();
        {
            let mut log = FileLogStore::open(&data_dir).expect("open");
            log.append(&entries(1, &[1, 1])).expect("append");
        }
        let path = tmp.path().join("raft").join("log.bin");
        let len = std::fs::metadata(&path).expect("metadata").len();
        (tmp, data_dir, path, len)
    }

    fn append_raw(path: &std::path::Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).expect("open raw");
        file.write_all(bytes).expect("write raw");
    }

    #[test]
    fn undecodable_final_frame_is_discarded_on_open() {
        let (_tmp, data_dir, path, len) = log_with_two_entries();
        // Complete header, body that ends before the term.
        append_raw(&path, &[1, 0, 0, 0, 1]);

        let mut log = FileLogStore::open(&data_dir).expect("reopen");
        assert_eq!(log.last_index(), 2);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), len);

        log.append(&entries(3, &[2])).expect("append after repair");
        let log = FileLogStore::open(&data_dir).expect("reopen again");
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn zero_filled_tail_is_discarded_on_open() {
        let (_tmp, data_dir, path, len) = log_with_two_entries();
        append_raw(&path, &[0u8; 64]);

        let log = FileLogStore::open(&data_dir).expect("reopen");
        assert_eq!(log.last_index(), 2);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), len);
    }

    #[test]
    fn undecodable_frame_before_valid_data_fails_open() {
        let (_tmp, data_dir, path, _) = log_with_two_entries();
        let mut bytes = vec![1, 0, 0, 0, 1];
        encode_frame(&LogEntry::noop(3, 1), &mut bytes).expect("encode");
        append_raw(&path, &bytes);

        let err = FileLogStore::open(&data_dir).err().expect("corrupt log");
        assert!(matches!(err, RaftError::SerializationError(_)));
    }

    #[test]
    fn frame_length_must_fit_in_header() {
        assert_eq!(frame_len(42).expect("fits"), 42);
        assert_eq!(frame_len(u32::MAX as usize).expect("fits"), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            frame_len(u32::MAX as usize + 1),
            Err(RaftError::SerializationError(_))
        ));
    }
}
