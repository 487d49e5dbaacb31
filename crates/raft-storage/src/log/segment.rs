//! # segment
//!
//! why: the durable log is split into bounded files so compaction is a file unlink
//! relations: owned by SegmentLogStorage
//! what: Segment, one `log_inprogress_*` or `log_*_*` file plus its in-memory index
//!
//! each entry is a 24 byte big-endian header followed by a bincode body:
//!
//! ```text
//! | term u64 | type u8 | reserved [u8; 3] | body_len u32 | body_crc u32 | header_crc u32 |
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::{info, warn};
use parking_lot::Mutex;
use raft_core::{ConfigurationEntry, ConfigurationManager, EntryType, LogEntry, PeerId, RaftError, Result};
use serde::{Deserialize, Serialize};

pub(crate) const ENTRY_HEADER_SIZE: usize = 24;

pub(crate) fn open_segment_name(first_index: u64) -> String {
    format!("log_inprogress_{:020}", first_index)
}

pub(crate) fn closed_segment_name(first_index: u64, last_index: u64) -> String {
    format!("log_{:020}_{:020}", first_index, last_index)
}

#[derive(Serialize)]
struct BodyRef<'a> {
    data: &'a [u8],
    peers: &'a Option<Vec<PeerId>>,
    old_peers: &'a Option<Vec<PeerId>>,
}

#[derive(Deserialize)]
struct Body {
    data: Vec<u8>,
    peers: Option<Vec<PeerId>>,
    old_peers: Option<Vec<PeerId>>,
}

fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(&BodyRef {
        data: &entry.data,
        peers: &entry.peers,
        old_peers: &entry.old_peers,
    })
    .map_err(|e| RaftError::Serialization(e.to_string()))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| RaftError::InvalidArgument(format!("entry {} is too large", entry.index())))?;

    let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len());
    buf.write_u64::<BigEndian>(entry.term())?;
    buf.write_u8(entry.entry_type as u8)?;
    buf.write_all(&[0u8; 3])?;
    buf.write_u32::<BigEndian>(body_len)?;
    buf.write_u32::<BigEndian>(crc32fast::hash(&body))?;
    let header_crc = crc32fast::hash(&buf);
    buf.write_u32::<BigEndian>(header_crc)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

struct EntryHeader {
    term: u64,
    entry_type: EntryType,
    body_len: u32,
    body_crc: u32,
}

fn decode_header(buf: &[u8; ENTRY_HEADER_SIZE]) -> Result<EntryHeader> {
    let header_crc = BigEndian::read_u32(&buf[20..24]);
    if crc32fast::hash(&buf[..20]) != header_crc {
        return Err(RaftError::Corrupted("entry header checksum mismatch".into()));
    }
    Ok(EntryHeader {
        term: BigEndian::read_u64(&buf[0..8]),
        entry_type: EntryType::try_from(buf[8])?,
        body_len: BigEndian::read_u32(&buf[12..16]),
        body_crc: BigEndian::read_u32(&buf[16..20]),
    })
}

fn decode_body(header: &EntryHeader, index: u64, body: &[u8]) -> Result<LogEntry> {
    if crc32fast::hash(body) != header.body_crc {
        return Err(RaftError::Corrupted(format!("entry {} body checksum mismatch", index)));
    }
    let body: Body = bincode::deserialize(body)
        .map_err(|e| RaftError::Corrupted(format!("entry {} undecodable: {}", index, e)))?;
    let mut entry = LogEntry::new(header.term, index, body.data);
    entry.entry_type = header.entry_type;
    entry.peers = body.peers;
    entry.old_peers = body.old_peers;
    Ok(entry)
}

/// read up to `buf.len()` bytes, returning how many were available
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug)]
struct SegmentState {
    is_open: bool,
    last_index: u64,
    bytes: u64,
    /// (file offset, term) of every entry, position i holds `first_index + i`
    offsets: Vec<(u64, u64)>,
    file: Option<File>,
}

/// one log file covering `[first_index, last_index]`
#[derive(Debug)]
pub struct Segment {
    dir: PathBuf,
    first_index: u64,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// the writable tail segment, named `log_inprogress_<first>`
    pub fn new_open(dir: impl AsRef<Path>, first_index: u64) -> Self {
        Self::with_state(dir, first_index, first_index - 1, true)
    }

    /// a sealed segment, named `log_<first>_<last>`
    pub fn new_closed(dir: impl AsRef<Path>, first_index: u64, last_index: u64) -> Self {
        Self::with_state(dir, first_index, last_index, false)
    }

    fn with_state(dir: impl AsRef<Path>, first_index: u64, last_index: u64, is_open: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            first_index,
            state: Mutex::new(SegmentState {
                is_open,
                last_index,
                bytes: 0,
                offsets: Vec::new(),
                file: None,
            }),
        }
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }

    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    fn file_path(&self, state: &SegmentState) -> PathBuf {
        if state.is_open {
            self.dir.join(open_segment_name(self.first_index))
        } else {
            self.dir.join(closed_segment_name(self.first_index, state.last_index))
        }
    }

    pub fn path(&self) -> PathBuf {
        let state = self.state.lock();
        self.file_path(&state)
    }

    /// create the backing file of a fresh open segment
    pub fn create(&self) -> Result<()> {
        let mut state = self.state.lock();
        assert!(state.is_open, "only open segments are created");
        let path = self.file_path(&state);
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        info!("created new segment {}", path.display());
        state.file = Some(file);
        state.bytes = 0;
        state.offsets.clear();
        state.last_index = self.first_index - 1;
        Ok(())
    }

    /// scan the file, rebuilding the offset index
    ///
    /// an incomplete trailing write is cut off; a checksum mismatch, or a
    /// closed segment that does not hold exactly its named range, is an error.
    /// configuration entries are handed to `configuration_manager`.
    pub fn load(&self, configuration_manager: &ConfigurationManager) -> Result<()> {
        let mut state = self.state.lock();
        let path = self.file_path(&state);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();

        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut index = self.first_index;
        loop {
            let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
            let n = read_full(&mut file, &mut header_buf)?;
            if n < ENTRY_HEADER_SIZE {
                break;
            }
            let header = decode_header(&header_buf)
                .map_err(|e| RaftError::Corrupted(format!("{} at offset {}: {}", path.display(), offset, e)))?;
            let mut body = vec![0u8; header.body_len as usize];
            if read_full(&mut file, &mut body)? < body.len() {
                break;
            }
            let entry = decode_body(&header, index, &body)
                .map_err(|e| RaftError::Corrupted(format!("{}: {}", path.display(), e)))?;
            if entry.is_configuration() {
                configuration_manager.add(ConfigurationEntry::from_log_entry(&entry))?;
            }
            offsets.push((offset, header.term));
            offset += (ENTRY_HEADER_SIZE + body.len()) as u64;
            index += 1;
        }
        let actual_last = index - 1;

        if !state.is_open {
            if actual_last < state.last_index {
                return Err(RaftError::Corrupted(format!(
                    "data lost in closed segment {}, last entry is {}",
                    path.display(),
                    actual_last
                )));
            }
            if actual_last > state.last_index {
                return Err(RaftError::Corrupted(format!(
                    "found garbage in closed segment {}, last entry is {}",
                    path.display(),
                    actual_last
                )));
            }
        }

        if offset != file_size {
            warn!(
                "truncating incomplete write in {} from {} to {} bytes",
                path.display(),
                file_size,
                offset
            );
            file.set_len(offset)?;
        }

        state.last_index = actual_last;
        state.bytes = offset;
        state.offsets = offsets;
        state.file = Some(file);
        Ok(())
    }

    /// append the next entry, which must be `last_index + 1`
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut state = self.state.lock();
        assert!(state.is_open, "append to closed segment {}", self.first_index);
        assert_eq!(entry.index(), state.last_index + 1, "segment append out of order");
        let buf = encode_entry(entry)?;
        let offset = state.bytes;
        let file = state.file.as_mut().ok_or_else(|| not_loaded(self.first_index))?;
        let written = file.seek(SeekFrom::Start(offset)).and_then(|_| file.write_all(&buf));
        if let Err(e) = written {
            // leave no partial entry behind for the next append
            let _ = file.set_len(offset);
            return Err(e.into());
        }
        state.offsets.push((offset, entry.term()));
        state.bytes += buf.len() as u64;
        state.last_index += 1;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(file) = &state.file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// read the entry at `index`, `None` outside this segment
    pub fn get(&self, index: u64) -> Result<Option<LogEntry>> {
        let mut state = self.state.lock();
        if index < self.first_index || index > state.last_index {
            return Ok(None);
        }
        let pos = (index - self.first_index) as usize;
        let (offset, _) = state.offsets[pos];
        let end = state.offsets.get(pos + 1).map_or(state.bytes, |&(o, _)| o);
        let file = state.file.as_mut().ok_or_else(|| not_loaded(self.first_index))?;

        let mut buf = vec![0u8; (end - offset) as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(RaftError::Corrupted(format!("entry {} is shorter than its header", index)));
        }
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
        header_buf.copy_from_slice(&buf[..ENTRY_HEADER_SIZE]);
        let header = decode_header(&header_buf)?;
        decode_body(&header, index, &buf[ENTRY_HEADER_SIZE..]).map(Some)
    }

    /// term of the entry at `index` from the in-memory index, 0 outside this segment
    pub fn get_term(&self, index: u64) -> u64 {
        let state = self.state.lock();
        if index < self.first_index || index > state.last_index {
            return 0;
        }
        state.offsets[(index - self.first_index) as usize].1
    }

    /// seal the segment, renaming it to `log_<first>_<last>`
    pub fn close(&self, will_sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        assert!(state.is_open, "segment {} is already closed", self.first_index);
        let old_path = self.file_path(&state);
        if will_sync {
            if let Some(file) = &state.file {
                file.sync_data()?;
            }
        }
        let new_path = self.dir.join(closed_segment_name(self.first_index, state.last_index));
        fs::rename(&old_path, &new_path)?;
        info!("closed segment {} -> {}", old_path.display(), new_path.display());
        state.is_open = false;
        Ok(())
    }

    /// drop every entry after `last_index_kept`, renaming a closed segment to match
    pub fn truncate(&self, last_index_kept: u64) -> Result<()> {
        let mut state = self.state.lock();
        if last_index_kept >= state.last_index {
            return Ok(());
        }
        assert!(
            last_index_kept + 1 >= self.first_index,
            "truncate({}) before segment start {}",
            last_index_kept,
            self.first_index
        );
        let keep = (last_index_kept + 1 - self.first_index) as usize;
        let truncate_size = state.offsets.get(keep).map_or(state.bytes, |&(o, _)| o);
        let file = state.file.as_mut().ok_or_else(|| not_loaded(self.first_index))?;
        file.set_len(truncate_size)?;

        if !state.is_open {
            let old_path = self.file_path(&state);
            let new_path = self.dir.join(closed_segment_name(self.first_index, last_index_kept));
            fs::rename(&old_path, &new_path)?;
            info!("renamed truncated segment {} -> {}", old_path.display(), new_path.display());
        }
        state.offsets.truncate(keep);
        state.bytes = truncate_size;
        state.last_index = last_index_kept;
        Ok(())
    }

    /// delete the backing file
    pub fn unlink(&self) -> Result<()> {
        let mut state = self.state.lock();
        let path = self.file_path(&state);
        state.file = None;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("unlinked segment {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_loaded(first_index: u64) -> RaftError {
    RaftError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("segment {} has no open file", first_index),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn append_get_and_reload() {
        let dir = tempdir().unwrap();
        let segment = Segment::new_open(dir.path(), 1);
        segment.create().unwrap();
        segment.append(&LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        segment
            .append(&LogEntry::configuration(1, 2, vec![peer("127.0.0.1:8001")], None))
            .unwrap();
        segment.append(&LogEntry::new(2, 3, b"c".to_vec())).unwrap();
        segment.sync().unwrap();

        assert_eq!(segment.get(1).unwrap().unwrap().data, b"a".to_vec());
        assert_eq!(segment.get_term(3), 2);
        assert!(segment.get(4).unwrap().is_none());

        let manager = ConfigurationManager::new();
        let reopened = Segment::new_open(dir.path(), 1);
        reopened.load(&manager).unwrap();
        assert_eq!(reopened.last_index(), 3);
        assert!(reopened.get(2).unwrap().unwrap().is_configuration());
        assert_eq!(manager.last_configuration().id.index, 2);
    }

    #[test]
    fn torn_tail_of_open_segment_is_cut() {
        let dir = tempdir().unwrap();
        let segment = Segment::new_open(dir.path(), 5);
        segment.create().unwrap();
        segment.append(&LogEntry::new(1, 5, b"five".to_vec())).unwrap();
        let good_len = segment.bytes();
        drop(segment);

        let path = dir.path().join(open_segment_name(5));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3, 4, 5]).unwrap();
        drop(file);

        let reopened = Segment::new_open(dir.path(), 5);
        reopened.load(&ConfigurationManager::new()).unwrap();
        assert_eq!(reopened.last_index(), 5);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn close_renames_and_truncate_renames_again() {
        let dir = tempdir().unwrap();
        let segment = Segment::new_open(dir.path(), 1);
        segment.create().unwrap();
        for i in 1..=4 {
            segment.append(&LogEntry::new(1, i, vec![i as u8])).unwrap();
        }
        segment.close(true).unwrap();
        assert!(dir.path().join(closed_segment_name(1, 4)).exists());

        segment.truncate(2).unwrap();
        assert!(dir.path().join(closed_segment_name(1, 2)).exists());
        assert_eq!(segment.last_index(), 2);
        assert!(segment.get(3).unwrap().is_none());

        let reopened = Segment::new_closed(dir.path(), 1, 2);
        reopened.load(&ConfigurationManager::new()).unwrap();
        assert_eq!(reopened.get(2).unwrap().unwrap().data, vec![2u8]);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let dir = tempdir().unwrap();
        let segment = Segment::new_open(dir.path(), 1);
        segment.create().unwrap();
        segment.append(&LogEntry::new(1, 1, b"payload".to_vec())).unwrap();
        drop(segment);

        let path = dir.path().join(open_segment_name(1));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let reopened = Segment::new_open(dir.path(), 1);
        let err = reopened.load(&ConfigurationManager::new()).unwrap_err();
        assert!(matches!(err, RaftError::Corrupted(_)));
    }
}
