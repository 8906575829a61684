use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{ClusterError, ClusterResult};
use crate::shard::map::MapRecord;

/// Durable history of committed map versions.
///
/// The Master appends a record before it applies it to the in-memory map and
/// replays every record on start. Anything not in the log never happened.
pub trait MapLog: Send + Sync {
    fn append(&self, record: &MapRecord) -> ClusterResult<()>;

    fn replay(&self) -> ClusterResult<Vec<MapRecord>>;
}

#[derive(Default)]
pub struct MemoryMapLog {
    records: Mutex<Vec<MapRecord>>,
}

impl MemoryMapLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MapLog for MemoryMapLog {
    fn append(&self, record: &MapRecord) -> ClusterResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn replay(&self) -> ClusterResult<Vec<MapRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Largest payload a frame may declare. Anything bigger is corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Append-only file of `len (u32 LE) | bincode payload | crc32 (u32 LE)` frames.
///
/// Every append is synced before it returns. A torn frame at the tail (crash
/// mid-append) is cut off when the log is opened, so later appends follow the
/// last complete frame. A checksum mismatch anywhere else is an error.
pub struct FileMapLog {
    path: PathBuf,
    file: Mutex<LogFile>,
}

struct LogFile {
    handle: File,
    /// Bytes covered by complete frames.
    len: u64,
}

impl FileMapLog {
    pub fn open(path: impl AsRef<Path>) -> ClusterResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;

        let (_, len) = scan(&path)?;
        let on_disk = handle.metadata().map_err(io_error)?.len();
        if on_disk > len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = on_disk - len,
                "Truncating torn frame at the end of the commit log"
            );
            handle.set_len(len).map_err(io_error)?;
            handle.sync_data().map_err(io_error)?;
        }

        Ok(Self {
            path,
            file: Mutex::new(LogFile { handle, len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MapLog for FileMapLog {
    fn append(&self, record: &MapRecord) -> ClusterResult<()> {
        let payload =
            bincode::serialize(record).map_err(|e| ClusterError::Storage(e.to_string()))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ClusterError::Storage(format!(
                "map record of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());

        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let file = &mut *guard;
        let written = file.handle.write_all(&frame);
        if let Err(e) = written.and_then(|_| file.handle.sync_data()) {
            // Never leave a partial frame for the next append to land behind.
            if let Err(trunc) = file.handle.set_len(file.len) {
                tracing::error!(path = %self.path.display(), error = %trunc, "Failed to drop partial frame");
            }
            return Err(io_error(e));
        }
        file.len += frame.len() as u64;
        Ok(())
    }

    fn replay(&self) -> ClusterResult<Vec<MapRecord>> {
        let (records, _) = scan(&self.path)?;
        Ok(records)
    }
}

/// Reads every complete frame and returns them with the byte length they cover.
fn scan(path: &Path) -> ClusterResult<(Vec<MapRecord>, u64)> {
    let file = File::open(path).map_err(io_error)?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match read_frame_part(&mut reader, &mut len_buf)? {
            FramePart::Complete => {}
            FramePart::Eof => break,
            FramePart::Torn => {
                tracing::warn!(path = %path.display(), "Commit log ends in a torn frame");
                break;
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ClusterError::Storage(format!(
                "commit log frame of {} bytes after {} records",
                len,
                records.len()
            )));
        }

        let mut payload = vec![0u8; len];
        let mut crc_buf = [0u8; 4];
        if !matches!(read_frame_part(&mut reader, &mut payload)?, FramePart::Complete)
            || !matches!(read_frame_part(&mut reader, &mut crc_buf)?, FramePart::Complete)
        {
            tracing::warn!(path = %path.display(), "Commit log ends in a torn frame");
            break;
        }

        if crc32fast::hash(&payload) != u32::from_le_bytes(crc_buf) {
            return Err(ClusterError::Storage(format!(
                "commit log checksum mismatch after {} records",
                records.len()
            )));
        }

        let record: MapRecord =
            bincode::deserialize(&payload).map_err(|e| ClusterError::Storage(e.to_string()))?;
        records.push(record);
        valid_len += (len + 8) as u64;
    }

    Ok((records, valid_len))
}

enum FramePart {
    Complete,
    Eof,
    Torn,
}

fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> ClusterResult<FramePart> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(FramePart::Eof),
            Ok(0) => return Ok(FramePart::Torn),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_error(e)),
        }
    }
    Ok(FramePart::Complete)
}

fn io_error(e: io::Error) -> ClusterError {
    ClusterError::Storage(e.to_string())
}
