//! Per-shard write-ahead log.
//!
//! A sequence of `wal.{N}` volumes where N is the revision the volume
//! starts at. Every mutating shard operation appends one record; replay on
//! reopen applies records strictly newer than the on-disk backend revision
//! and is idempotent.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};

use crate::backend::DocId;
use crate::errors::{Error, Result};
use crate::serialise::{serialise_length, serialise_strings, unserialise_length, unserialise_strings};

pub const WAL_PATH: &str = "wal.";

#[derive(Debug, Clone, PartialEq)]
pub enum WalOp {
    Commit,
    AddDocument { doc: Vec<u8> },
    DeleteDocumentId { did: DocId },
    DeleteDocumentTerm { term: Vec<u8> },
    ReplaceDocumentId { did: DocId, doc: Vec<u8> },
    ReplaceDocumentTerm { term: Vec<u8>, doc: Vec<u8> },
    SetMetadata { key: Vec<u8>, value: Vec<u8> },
    AddSpelling { word: Vec<u8>, freq: u32 },
    RemoveSpelling { word: Vec<u8>, freq: u32 },
}

impl WalOp {
    fn opcode(&self) -> u8 {
        match self {
            WalOp::Commit => 0,
            WalOp::AddDocument { .. } => 1,
            WalOp::DeleteDocumentId { .. } => 2,
            WalOp::DeleteDocumentTerm { .. } => 3,
            WalOp::ReplaceDocumentId { .. } => 4,
            WalOp::ReplaceDocumentTerm { .. } => 5,
            WalOp::SetMetadata { .. } => 6,
            WalOp::AddSpelling { .. } => 7,
            WalOp::RemoveSpelling { .. } => 8,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            WalOp::Commit => Vec::new(),
            WalOp::AddDocument { doc } => doc.clone(),
            WalOp::DeleteDocumentId { did } => serialise_length(u64::from(*did)),
            WalOp::DeleteDocumentTerm { term } => term.clone(),
            WalOp::ReplaceDocumentId { did, doc } => {
                let mut out = serialise_length(u64::from(*did));
                out.extend_from_slice(doc);
                out
            }
            WalOp::ReplaceDocumentTerm { term, doc } => {
                serialise_strings([term.as_slice(), doc.as_slice()])
            }
            WalOp::SetMetadata { key, value } => {
                serialise_strings([key.as_slice(), value.as_slice()])
            }
            WalOp::AddSpelling { word, freq } | WalOp::RemoveSpelling { word, freq } => {
                let mut out = serialise_length(word.len() as u64);
                out.extend_from_slice(word);
                out.extend_from_slice(&serialise_length(u64::from(*freq)));
                out
            }
        }
    }

    fn decode(opcode: u8, payload: &[u8]) -> Result<WalOp> {
        Ok(match opcode {
            0 => WalOp::Commit,
            1 => WalOp::AddDocument { doc: payload.to_vec() },
            2 => {
                let (did, _) = unserialise_length(payload)?;
                WalOp::DeleteDocumentId { did: did as DocId }
            }
            3 => WalOp::DeleteDocumentTerm { term: payload.to_vec() },
            4 => {
                let (did, n) = unserialise_length(payload)?;
                WalOp::ReplaceDocumentId {
                    did: did as DocId,
                    doc: payload[n..].to_vec(),
                }
            }
            5 => {
                let parts = unserialise_strings(payload)?;
                if parts.len() != 2 {
                    return Err(Error::Serialisation("bad replace-term record".into()));
                }
                let mut parts = parts.into_iter();
                WalOp::ReplaceDocumentTerm {
                    term: parts.next().unwrap(),
                    doc: parts.next().unwrap(),
                }
            }
            6 => {
                let parts = unserialise_strings(payload)?;
                if parts.len() != 2 {
                    return Err(Error::Serialisation("bad metadata record".into()));
                }
                let mut parts = parts.into_iter();
                WalOp::SetMetadata {
                    key: parts.next().unwrap(),
                    value: parts.next().unwrap(),
                }
            }
            7 | 8 => {
                let (len, n) = unserialise_length(payload)?;
                let len = len as usize;
                if payload.len() < n + len {
                    return Err(Error::Serialisation("bad spelling record".into()));
                }
                let word = payload[n..n + len].to_vec();
                let (freq, _) = unserialise_length(&payload[n + len..])?;
                if opcode == 7 {
                    WalOp::AddSpelling { word, freq: freq as u32 }
                } else {
                    WalOp::RemoveSpelling { word, freq: freq as u32 }
                }
            }
            other => {
                return Err(Error::Serialisation(format!("bad wal opcode {other}")));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub revision: u64,
    pub op: WalOp,
}

#[derive(Debug)]
pub struct DatabaseWal {
    base_path: PathBuf,
    synchronous: bool,
    volume_cap: u64,
    volume: Option<u64>,
    file: Option<File>,
}

impl DatabaseWal {
    pub fn open(base_path: impl Into<PathBuf>, synchronous: bool, volume_cap: u64) -> DatabaseWal {
        DatabaseWal {
            base_path: base_path.into(),
            synchronous,
            volume_cap,
            volume: None,
            file: None,
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn volume_path(&self, volume: u64) -> PathBuf {
        self.base_path.join(format!("{WAL_PATH}{volume}"))
    }

    pub fn current_volume_path(&self) -> Option<PathBuf> {
        self.volume.map(|v| self.volume_path(v))
    }

    /// Sorted starting revisions of the existing volumes.
    pub fn volumes(base_path: &Path) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(rest) = name.strip_prefix(WAL_PATH) {
                    if let Ok(volume) = rest.parse::<u64>() {
                        out.push(volume);
                    }
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn ensure_volume(&mut self, revision: u64) -> Result<&mut File> {
        if self.file.is_none() {
            let volumes = DatabaseWal::volumes(&self.base_path)?;
            let volume = volumes.last().copied().unwrap_or(revision);
            fs::create_dir_all(&self.base_path)?;
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(self.volume_path(volume))?;
            self.volume = Some(volume);
            self.file = Some(file);
        }

        let len = self.file.as_mut().unwrap().metadata()?.len();
        if len >= self.volume_cap {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(self.volume_path(revision))?;
            self.volume = Some(revision);
            self.file = Some(file);
        }

        Ok(self.file.as_mut().unwrap())
    }

    /// Appends one record. Mutations carry the revision their commit will
    /// produce; the commit record carries the revision it produced.
    pub fn append(&mut self, revision: u64, op: &WalOp) -> Result<()> {
        let payload = op.payload();
        let mut buf = BytesMut::with_capacity(payload.len() + 24);
        buf.extend_from_slice(&serialise_length(payload.len() as u64));
        buf.put_u64_le(revision);
        buf.put_u8(op.opcode());
        buf.extend_from_slice(&payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&revision.to_le_bytes());
        hasher.update(&[op.opcode()]);
        hasher.update(&payload);
        buf.put_u32_le(hasher.finalize());

        let synchronous = self.synchronous;
        let file = self.ensure_volume(revision)?;
        file.write_all(&buf)?;
        file.flush()?;
        if synchronous {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn write_commit(&mut self, revision: u64) -> Result<()> {
        self.append(revision, &WalOp::Commit)
    }

    pub fn write_add_document(&mut self, revision: u64, doc: Vec<u8>) -> Result<()> {
        self.append(revision, &WalOp::AddDocument { doc })
    }

    pub fn write_delete_document(&mut self, revision: u64, did: DocId) -> Result<()> {
        self.append(revision, &WalOp::DeleteDocumentId { did })
    }

    pub fn write_delete_document_term(&mut self, revision: u64, term: Vec<u8>) -> Result<()> {
        self.append(revision, &WalOp::DeleteDocumentTerm { term })
    }

    pub fn write_replace_document(&mut self, revision: u64, did: DocId, doc: Vec<u8>) -> Result<()> {
        self.append(revision, &WalOp::ReplaceDocumentId { did, doc })
    }

    pub fn write_replace_document_term(
        &mut self,
        revision: u64,
        term: Vec<u8>,
        doc: Vec<u8>,
    ) -> Result<()> {
        self.append(revision, &WalOp::ReplaceDocumentTerm { term, doc })
    }

    pub fn write_set_metadata(&mut self, revision: u64, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.append(revision, &WalOp::SetMetadata { key, value })
    }

    pub fn write_add_spelling(&mut self, revision: u64, word: Vec<u8>, freq: u32) -> Result<()> {
        self.append(revision, &WalOp::AddSpelling { word, freq })
    }

    pub fn write_remove_spelling(&mut self, revision: u64, word: Vec<u8>, freq: u32) -> Result<()> {
        self.append(revision, &WalOp::RemoveSpelling { word, freq })
    }

    /// All records with revision strictly greater than `after`, in append
    /// order. Torn trailing records are dropped with a warning; corruption
    /// in the middle of a volume is surfaced.
    pub fn records_after(&self, after: u64) -> Result<Vec<WalRecord>> {
        let mut out = Vec::new();
        for volume in DatabaseWal::volumes(&self.base_path)? {
            let path = self.volume_path(volume);
            let mut file = File::open(&path)?;
            let len = file.metadata()?.len();
            let mut bytes = Vec::with_capacity(len as usize);
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut bytes)?;

            let mut cursor = &bytes[..];
            while !cursor.is_empty() {
                let record = match decode_record(cursor) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "dropping torn wal tail");
                        break;
                    }
                };
                let (record, consumed) = record;
                cursor = &cursor[consumed..];
                if record.revision > after {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }
}

fn decode_record(bytes: &[u8]) -> Result<(WalRecord, usize)> {
    let (payload_len, n) = unserialise_length(bytes)?;
    let payload_len = payload_len as usize;
    let total = n + 8 + 1 + payload_len + 4;
    if bytes.len() < total {
        return Err(Error::Serialisation("truncated wal record".into()));
    }
    let revision = u64::from_le_bytes(bytes[n..n + 8].try_into().unwrap());
    let opcode = bytes[n + 8];
    let payload = &bytes[n + 9..n + 9 + payload_len];
    let stored_crc = u32::from_le_bytes(bytes[total - 4..total].try_into().unwrap());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&revision.to_le_bytes());
    hasher.update(&[opcode]);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(Error::CorruptVolume("wal record checksum mismatch".into()));
    }

    let op = WalOp::decode(opcode, payload)?;
    Ok((WalRecord { revision, op }, total))
}
