use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::model::Event;

/// Leading bytes of every journal file.
const MAGIC: &[u8; 8] = b"ROOMYJ01";

#[derive(Debug, Error)]
pub enum WalError {
    #[error("journal I/O: {0}")]
    Io(#[from] io::Error),
    #[error("journal encoding: {0}")]
    Encode(#[from] bincode::Error),
    #[error("{0} is not a journal file")]
    BadHeader(PathBuf),
}

/// Encode a single event to [len][bincode][crc32] format. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> Result<u64, WalError> {
    let payload = bincode::serialize(event)?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + 8)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Events recovered from disk and the byte length of the intact prefix.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
    pub file_len: u64,
}

/// Append-only journal of engine events.
///
/// Layout: an 8-byte magic header, then per entry `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail (crash mid-write) is discarded on replay and cut off on open.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length up to the last successful `flush_sync`.
    committed_len: u64,
    /// Bytes and events buffered since then.
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the journal at `path`, truncating any torn tail.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        let mut committed_len = replay.valid_len;
        if replay.file_len == 0 {
            let mut header = &file;
            header.write_all(MAGIC)?;
            file.sync_all()?;
            committed_len = MAGIC.len() as u64;
        } else if replay.valid_len < replay.file_len {
            warn!(
                path = %path.display(),
                kept = replay.valid_len,
                dropped = replay.file_len - replay.valid_len,
                "truncating torn journal tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
        })
    }

    /// Append a single event and fsync. Production code batches with
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> Result<(), WalError> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. `flush_sync()` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> Result<(), WalError> {
        // Partial writes of a failed encode are cut off by `discard_pending`.
        let written = encode_event(&mut self.writer, event)?;
        self.pending_len += written;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.appends_since_compact += self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// including bytes the buffer already pushed to the file.
    pub fn discard_pending(&mut self) -> Result<(), WalError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // `into_parts` hands back the buffer instead of writing it out on drop.
        let _ = stale.into_parts();
        self.writer.get_ref().set_len(self.committed_len)?;
        self.writer.get_ref().sync_all()?;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot journal to a temp file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> Result<(), WalError> {
        let file = File::create(tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the journal and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        fs::rename(tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_len = 0;
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> Result<(), WalError> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event. Stops at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> Result<Replay, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(Replay::default());
        }
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        match reader.read_exact(&mut magic) {
            Ok(()) if &magic == MAGIC => {}
            Ok(()) => return Err(WalError::BadHeader(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(WalError::BadHeader(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut events = Vec::new();
        let mut valid_len = MAGIC.len() as u64;
        loop {
            let mut len_buf = [0u8; 4];
            if !read_or_eof(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as u64;
            if valid_len + 8 + len > file_len {
                break; // length runs past the file
            }
            let mut payload = vec![0u8; len as usize];
            if !read_or_eof(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_or_eof(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
            valid_len += 8 + len;
        }

        Ok(Replay {
            events,
            valid_len,
            file_len,
        })
    }
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
