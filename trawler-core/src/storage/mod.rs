//! Append-only volumed blob storage.
//!
//! Each shard directory holds numbered `docdata.{V}` volumes. A volume is a
//! block-aligned header followed by length-prefixed, checksummed records;
//! records are never rewritten, deletion sets a flag, compaction is
//! external.

pub mod data;

pub use data::{Data, Locator, LocatorType, STORED_BLOB, STORED_CONTENT_TYPE};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::errors::{Error, Result};

pub const DATA_STORAGE_PATH: &str = "docdata.";

const STORAGE_BLOCK_SIZE: u64 = 4096;
const VOLUME_MAGIC: &[u8; 4] = b"TRWB";
const RECORD_MAGIC: u8 = 0x1e;
const FOOTER_MAGIC: u8 = 0x1d;
const RECORD_HEADER_SIZE: u64 = 6;
const RECORD_FOOTER_SIZE: u64 = 5;

pub const FLAG_DELETED: u8 = 0x01;

#[derive(Debug)]
pub struct BlobStorage {
    base_path: PathBuf,
    uuid: Uuid,
    writable: bool,
    volume_cap: u64,
    /// Current volume counter; callers bump it when a volume fills up.
    pub volume: u32,
    file: Option<File>,
    write_offset: u64,
    read_position: u64,
}

impl BlobStorage {
    pub fn new(base_path: impl Into<PathBuf>, uuid: Uuid, writable: bool, volume_cap: u64) -> BlobStorage {
        BlobStorage {
            base_path: base_path.into(),
            uuid,
            writable,
            volume_cap,
            volume: 0,
            file: None,
            write_offset: 0,
            read_position: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    fn volume_path(&self, volume: u32) -> PathBuf {
        self.base_path.join(format!("{DATA_STORAGE_PATH}{volume}"))
    }

    /// Opens (creating, for writable stores) the numbered volume and
    /// validates its header against the owning shard's UUID.
    pub fn open(&mut self, volume: u32) -> Result<()> {
        let path = self.volume_path(volume);
        let mut file = if self.writable {
            fs::create_dir_all(&self.base_path)?;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?
        } else {
            File::open(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::NotFound(format!("storage volume not found: {}", path.display()))
                }
                _ => Error::Io(e.to_string()),
            })?
        };

        let len = file.metadata()?.len();
        if len == 0 {
            if !self.writable {
                return Err(Error::CorruptVolume(format!(
                    "empty storage volume: {}",
                    path.display()
                )));
            }
            let mut header = BytesMut::with_capacity(STORAGE_BLOCK_SIZE as usize);
            header.extend_from_slice(VOLUME_MAGIC);
            header.put_u32_le(STORAGE_BLOCK_SIZE as u32);
            header.extend_from_slice(self.uuid.as_bytes());
            header.resize(STORAGE_BLOCK_SIZE as usize, 0);
            file.write_all(&header)?;
            file.sync_data()?;
            self.write_offset = STORAGE_BLOCK_SIZE;
        } else {
            let mut header = [0u8; 24];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header).map_err(|_| {
                Error::CorruptVolume(format!("short storage header: {}", path.display()))
            })?;
            if &header[..4] != VOLUME_MAGIC {
                return Err(Error::CorruptVolume(format!(
                    "bad storage magic number: {}",
                    path.display()
                )));
            }
            let uuid = Uuid::from_slice(&header[8..24])
                .map_err(|e| Error::CorruptVolume(format!("bad storage uuid: {e}")))?;
            if uuid != self.uuid {
                return Err(Error::CorruptVolume(format!(
                    "storage uuid mismatch: {}",
                    path.display()
                )));
            }
            self.write_offset = len;
        }

        self.volume = volume;
        self.read_position = STORAGE_BLOCK_SIZE;
        self.file = Some(file);
        Ok(())
    }

    /// Appends a length-prefixed, checksummed record. Fails with
    /// `StorageEof` when the volume's soft cap would be exceeded; callers
    /// bump the volume counter, open the next volume and retry.
    pub fn write(&mut self, payload: &[u8]) -> Result<u32> {
        if !self.writable {
            return Err(Error::InvalidArgument("storage is read-only".into()));
        }
        let file = self
            .file
            .as_mut()
            .ok_or(Error::DatabaseClosed)?;

        let record_len = RECORD_HEADER_SIZE + payload.len() as u64 + RECORD_FOOTER_SIZE;
        if self.write_offset + record_len > self.volume_cap {
            return Err(Error::StorageEof);
        }

        let offset = self.write_offset;
        let mut buf = BytesMut::with_capacity(record_len as usize);
        buf.put_u8(RECORD_MAGIC);
        buf.put_u8(0);
        buf.put_u32_le(payload.len() as u32);
        buf.extend_from_slice(payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        buf.put_u32_le(hasher.finalize());
        buf.put_u8(FOOTER_MAGIC);

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        self.write_offset += record_len;
        Ok(offset as u32)
    }

    /// Positions the read cursor on a record start.
    pub fn seek(&mut self, offset: u32) -> Result<()> {
        if u64::from(offset) < STORAGE_BLOCK_SIZE {
            return Err(Error::CorruptVolume(format!(
                "record offset {offset} inside storage header"
            )));
        }
        self.read_position = u64::from(offset);
        Ok(())
    }

    /// Reads one full record at the cursor, verifying framing and
    /// checksum.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        let position = self.read_position;
        let file = self
            .file
            .as_mut()
            .ok_or(Error::DatabaseClosed)?;

        file.seek(SeekFrom::Start(position))?;
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| Error::CorruptVolume("short record header".into()))?;
        let mut cur = &header[..];
        let magic = cur.get_u8();
        let flags = cur.get_u8();
        let size = cur.get_u32_le() as usize;
        if magic != RECORD_MAGIC {
            return Err(Error::CorruptVolume("bad record magic number".into()));
        }
        if flags & FLAG_DELETED != 0 {
            return Err(Error::StorageNotFound);
        }

        let mut payload = vec![0u8; size];
        file.read_exact(&mut payload)
            .map_err(|_| Error::CorruptVolume("short record payload".into()))?;
        let mut footer = [0u8; RECORD_FOOTER_SIZE as usize];
        file.read_exact(&mut footer)
            .map_err(|_| Error::CorruptVolume("short record footer".into()))?;
        let mut cur = &footer[..];
        let stored_crc = cur.get_u32_le();
        let footer_magic = cur.get_u8();
        if footer_magic != FOOTER_MAGIC {
            return Err(Error::CorruptVolume("bad record footer magic".into()));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(Error::CorruptVolume("record checksum mismatch".into()));
        }

        self.read_position = position + RECORD_HEADER_SIZE + size as u64 + RECORD_FOOTER_SIZE;
        Ok(payload)
    }

    /// Flushes buffered writes; returns the path the caller should hand to
    /// the async-fsync debouncer.
    pub fn commit(&mut self) -> Result<Option<PathBuf>> {
        match self.file.as_mut() {
            Some(file) => {
                file.flush()?;
                Ok(Some(self.volume_path(self.volume)))
            }
            None => Ok(None),
        }
    }

    /// Scans the base directory for `{prefix}{N}` files and returns the
    /// numeric range found (0, 0) when there are none.
    pub fn get_volumes_range(base_path: &Path, prefix: &str) -> Result<(u32, u32)> {
        let mut first = u32::MAX;
        let mut last = 0;
        let entries = match fs::read_dir(base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Some(rest) = name.strip_prefix(prefix) {
                    if let Ok(volume) = rest.parse::<u32>() {
                        first = first.min(volume);
                        last = last.max(volume);
                    }
                }
            }
        }
        if first == u32::MAX {
            Ok((0, 0))
        } else {
            Ok((first, last))
        }
    }
}

#[cfg(test)]
mod tests;
