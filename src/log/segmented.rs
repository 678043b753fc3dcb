//! A durable [`RaftLog`](super::RaftLog) stored as a sequence of segment files.
//!
//! Each segment starts with a header naming the index of the entry preceding its first record. Records are
//! `[u32 length][u32 crc32][protobuf LogEntry]`. A new segment is started once the current one reaches the configured
//! rotation size. On open, all segments are scanned; a torn or corrupt record at the tail of the last segment is cut
//! off, which restores the log to its last durably appended state. Corruption anywhere else is an error.

use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use prost::Message as _;

use crate::error::LogError;
use crate::{Index, Term};

use super::{check_append, check_commit, check_truncate, LogEntry, RaftLog};

const SEGMENT_MAGIC: u32 = 0x524c_4f47;
const SEGMENT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 4 + 2 + 8;
const RECORD_HEADER_LEN: u64 = 4 + 4;
const SEGMENT_PREFIX: &str = "raft.log.";

/// Location of one record on disk.
#[derive(Clone, Copy, Debug)]
struct Position {
    segment: u64,
    offset: u64,
    len: u32,
    term: Term,
}

/// A durable, segmented implementation of [`RaftLog`](super::RaftLog).
pub struct SegmentedRaftLog {
    directory: PathBuf,
    rotation_size: u64,
    positions: Vec<Position>,
    commit_index: Index,
    writer: File,
    segment: u64,
    segment_size: u64,
}

impl SegmentedRaftLog {
    /// Opens the log stored in `directory`, creating it if necessary, and recovers its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a segment other than the last is corrupt.
    pub fn open(directory: impl AsRef<Path>, rotation_size: u64) -> Result<Self, LogError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let segments = list_segments(&directory)?;
        let mut positions = Vec::new();
        let last_segment = segments.last().copied();
        for &segment in &segments {
            let is_last = Some(segment) == last_segment;
            recover_segment(&directory, segment, is_last, &mut positions)?;
        }

        let segment = last_segment.unwrap_or(0);
        let path = segment_path(&directory, segment);
        if last_segment.is_none() {
            create_segment(&path, -1)?;
        }
        let writer = OpenOptions::new().append(true).open(&path)?;
        let segment_size = writer.metadata()?.len();

        info!(
            "opened raft log at {} with {} entries in {} segments",
            directory.display(),
            positions.len(),
            segments.len().max(1)
        );
        Ok(Self {
            directory,
            rotation_size,
            positions,
            commit_index: -1,
            writer,
            segment,
            segment_size,
        })
    }

    /// Returns the number of segment files currently making up the log.
    pub fn segment_count(&self) -> Result<usize, LogError> {
        Ok(list_segments(&self.directory)?.len())
    }

    fn rotate(&mut self, prev_index: Index) -> Result<(), LogError> {
        self.writer.sync_data()?;
        let segment = self.segment + 1;
        let path = segment_path(&self.directory, segment);
        create_segment(&path, prev_index)?;
        self.writer = OpenOptions::new().append(true).open(&path)?;
        self.segment = segment;
        self.segment_size = HEADER_LEN;
        debug!("rotated raft log to segment {} after index {}", segment, prev_index);
        Ok(())
    }

    fn position(&self, index: Index) -> Option<&Position> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.positions.get(index))
    }
}

impl RaftLog for SegmentedRaftLog {
    fn append(&mut self, index: Index, entry: LogEntry) -> Result<(), LogError> {
        check_append(index, self.append_index())?;

        let body = entry.encode_to_vec();
        let record_len = RECORD_HEADER_LEN + body.len() as u64;
        if self.segment_size > HEADER_LEN && self.segment_size + record_len > self.rotation_size {
            self.rotate(index - 1)?;
        }

        let mut record = Vec::with_capacity(record_len as usize);
        record.write_u32::<BigEndian>(body.len() as u32)?;
        record.write_u32::<BigEndian>(crc32fast::hash(&body))?;
        record.extend_from_slice(&body);
        self.writer.write_all(&record)?;

        self.positions.push(Position {
            segment: self.segment,
            offset: self.segment_size,
            len: body.len() as u32,
            term: entry.term,
        });
        self.segment_size += record_len;
        Ok(())
    }

    fn read(&self, from: Index, max_entries: usize) -> Result<Vec<LogEntry>, LogError> {
        let mut entries = Vec::new();
        let mut open: Option<(u64, File)> = None;
        let end = from.saturating_add(max_entries as Index);
        for index in from.max(0)..end {
            let position = match self.position(index) {
                Some(position) => *position,
                None => break,
            };
            let mut file = match open.take() {
                Some((segment, file)) if segment == position.segment => file,
                _ => File::open(segment_path(&self.directory, position.segment))?,
            };
            file.seek(SeekFrom::Start(position.offset + RECORD_HEADER_LEN))?;
            let mut body = vec![0; position.len as usize];
            file.read_exact(&mut body)?;
            entries.push(LogEntry::decode(body.as_slice())?);
            open = Some((position.segment, file));
        }
        Ok(entries)
    }

    fn read_term(&self, index: Index) -> Result<Option<Term>, LogError> {
        if index == -1 {
            return Ok(Some(0));
        }
        Ok(self.position(index).map(|position| position.term))
    }

    fn truncate(&mut self, from: Index) -> Result<usize, LogError> {
        check_truncate(from, self.append_index(), self.commit_index)?;
        let cut = self.positions[from as usize];

        self.writer.sync_data()?;
        for segment in list_segments(&self.directory)? {
            if segment > cut.segment {
                fs::remove_file(segment_path(&self.directory, segment))?;
            }
        }
        let path = segment_path(&self.directory, cut.segment);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(cut.offset)?;
        file.sync_all()?;

        self.writer = OpenOptions::new().append(true).open(&path)?;
        self.segment = cut.segment;
        self.segment_size = cut.offset;

        let removed = self.positions.len() - from as usize;
        self.positions.truncate(from as usize);
        info!("truncated {} raft log entries from {}", removed, from);
        Ok(removed)
    }

    fn commit(&mut self, index: Index) -> Result<(), LogError> {
        check_commit(index, self.append_index())?;
        self.commit_index = self.commit_index.max(index);
        Ok(())
    }

    fn append_index(&self) -> Index {
        self.positions.len() as Index - 1
    }

    fn commit_index(&self) -> Index {
        self.commit_index
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.writer.sync_data()?;
        Ok(())
    }
}

//
// segment files
//

fn segment_path(directory: &Path, segment: u64) -> PathBuf {
    directory.join(format!("{}{}", SEGMENT_PREFIX, segment))
}

fn list_segments(directory: &Path) -> Result<Vec<u64>, LogError> {
    let mut segments = Vec::new();
    for dir_entry in fs::read_dir(directory)? {
        let file_name = dir_entry?.file_name();
        let segment = file_name
            .to_str()
            .and_then(|name| name.strip_prefix(SEGMENT_PREFIX))
            .and_then(|suffix| suffix.parse::<u64>().ok());
        if let Some(segment) = segment {
            segments.push(segment);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn create_segment(path: &Path, prev_index: Index) -> Result<(), LogError> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_u32::<BigEndian>(SEGMENT_MAGIC)?;
    file.write_u16::<BigEndian>(SEGMENT_VERSION)?;
    file.write_i64::<BigEndian>(prev_index)?;
    file.sync_all()?;
    Ok(())
}

fn recover_segment(
    directory: &Path,
    segment: u64,
    is_last: bool,
    positions: &mut Vec<Position>,
) -> Result<(), LogError> {
    let path = segment_path(directory, segment);
    let data = fs::read(&path)?;
    let corrupt = |offset: u64, reason: &str| LogError::Corrupt {
        segment,
        offset,
        reason: reason.to_string(),
    };

    let mut header = io::Cursor::new(&data);
    let magic = header.read_u32::<BigEndian>();
    let version = header.read_u16::<BigEndian>();
    let prev_index = header.read_i64::<BigEndian>();
    let prev_index = match (magic, version, prev_index) {
        (Ok(SEGMENT_MAGIC), Ok(SEGMENT_VERSION), Ok(prev_index)) => prev_index,
        _ if is_last && data.len() < HEADER_LEN as usize => {
            warn!("rewriting torn header of raft log segment {}", segment);
            fs::remove_file(&path)?;
            create_segment(&path, positions.len() as Index - 1)?;
            return Ok(());
        }
        _ => return Err(corrupt(0, "bad segment header")),
    };
    if prev_index != positions.len() as Index - 1 {
        return Err(corrupt(0, "segment does not continue the previous segment"));
    }

    let mut offset = HEADER_LEN;
    while offset < data.len() as u64 {
        match read_record(&data, offset) {
            Some((len, term)) => {
                positions.push(Position {
                    segment,
                    offset,
                    len,
                    term,
                });
                offset += RECORD_HEADER_LEN + len as u64;
            }
            None if is_last => {
                warn!(
                    "discarding torn raft log tail in segment {} at offset {}",
                    segment, offset
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(offset)?;
                file.sync_all()?;
                break;
            }
            None => return Err(corrupt(offset, "bad record")),
        }
    }
    Ok(())
}

/// Validates the record at `offset`, returning its body length and entry term.
fn read_record(data: &[u8], offset: u64) -> Option<(u32, Term)> {
    let mut cursor = io::Cursor::new(data.get(offset as usize..)?);
    let len = cursor.read_u32::<BigEndian>().ok()?;
    let crc = cursor.read_u32::<BigEndian>().ok()?;
    let start = (offset + RECORD_HEADER_LEN) as usize;
    let body = data.get(start..start.checked_add(len as usize)?)?;
    if crc32fast::hash(body) != crc {
        return None;
    }
    let entry = LogEntry::decode(body).ok()?;
    Some((len, entry.term))
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use crate::raft_log_tests;

    use super::*;

    fn open_temp() -> SegmentedRaftLog {
        let directory = tempfile::tempdir().unwrap().into_path();
        SegmentedRaftLog::open(directory, 256).unwrap()
    }

    raft_log_tests!(SegmentedRaftLog, open_temp());

    fn entry(term: Term, fill: u8) -> LogEntry {
        LogEntry::new(term, Bytes::from(vec![fill; 40]))
    }

    #[test]
    fn recovers_after_reopen_across_segments() {
        let directory = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentedRaftLog::open(directory.path(), 128).unwrap();
            for index in 0..10 {
                log.append(index, entry(1 + index as u64 / 3, index as u8)).unwrap();
            }
            log.sync().unwrap();
            assert!(log.segment_count().unwrap() > 1);
        }

        let log = SegmentedRaftLog::open(directory.path(), 128).unwrap();
        assert_eq!(log.append_index(), 9);
        assert_eq!(log.read_term(9).unwrap(), Some(4));
        let entries = log.read(0, 100).unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[7], entry(3, 7));
    }

    #[test]
    fn truncate_removes_later_segments() {
        let directory = tempfile::tempdir().unwrap();
        let mut log = SegmentedRaftLog::open(directory.path(), 128).unwrap();
        for index in 0..10 {
            log.append(index, entry(1, index as u8)).unwrap();
        }
        let segments = log.segment_count().unwrap();
        log.truncate(2).unwrap();
        assert!(log.segment_count().unwrap() < segments);
        log.append(2, entry(2, 0xff)).unwrap();
        log.sync().unwrap();
        drop(log);

        let log = SegmentedRaftLog::open(directory.path(), 128).unwrap();
        assert_eq!(log.append_index(), 2);
        assert_eq!(log.read_entry(2).unwrap(), Some(entry(2, 0xff)));
    }

    #[test]
    fn discards_torn_tail() {
        let directory = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentedRaftLog::open(directory.path(), 1 << 20).unwrap();
            for index in 0..3 {
                log.append(index, entry(1, index as u8)).unwrap();
            }
            log.sync().unwrap();
        }
        let path = segment_path(directory.path(), 0);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 5)
            .unwrap();

        let mut log = SegmentedRaftLog::open(directory.path(), 1 << 20).unwrap();
        assert_eq!(log.append_index(), 1);
        log.append(2, entry(2, 9)).unwrap();
        assert_eq!(log.read_entry(2).unwrap(), Some(entry(2, 9)));
    }

    #[test]
    fn corrupt_middle_segment_is_fatal() {
        let directory = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentedRaftLog::open(directory.path(), 128).unwrap();
            for index in 0..10 {
                log.append(index, entry(1, index as u8)).unwrap();
            }
            log.sync().unwrap();
        }
        let path = segment_path(directory.path(), 0);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert!(matches!(
            SegmentedRaftLog::open(directory.path(), 128),
            Err(LogError::Corrupt { segment: 0, .. })
        ));
    }
}
