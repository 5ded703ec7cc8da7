//! Embedded index backend.
//!
//! One instance per shard directory: documents with terms and slot values,
//! a posting list per term, metadata KV and a spelling dictionary. Working
//! state lives in memory; commits write a checksummed snapshot whose
//! revision advances by exactly one per committing flush.

pub mod document;
pub mod matcher;

pub use document::{DocId, Document, Term, DB_SLOT_ID, DB_SLOT_SHARDS, DB_SLOT_VERSION};

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::serialise::{serialise_length, unserialise_length};

const SNAPSHOT_MAGIC: &[u8; 8] = b"TRWIDX01";
const SNAPSHOT_FILE: &str = "index.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    Create,
    CreateOrOpen,
    CreateOrOverwrite,
}

#[derive(Debug, Clone, Default)]
struct State {
    next_did: DocId,
    documents: BTreeMap<DocId, Document>,
    postings: BTreeMap<Term, BTreeSet<DocId>>,
    metadata: BTreeMap<Vec<u8>, Vec<u8>>,
    spelling: BTreeMap<Vec<u8>, u32>,
}

impl State {
    fn insert_doc(&mut self, did: DocId, doc: Document) {
        self.remove_doc(did);
        for term in doc.terms() {
            self.postings.entry(term.clone()).or_default().insert(did);
        }
        self.documents.insert(did, doc);
        if did > self.next_did {
            self.next_did = did;
        }
    }

    fn remove_doc(&mut self, did: DocId) -> bool {
        if let Some(old) = self.documents.remove(&did) {
            for term in old.terms() {
                if let Some(postings) = self.postings.get_mut(term) {
                    postings.remove(&did);
                    if postings.is_empty() {
                        self.postings.remove(term);
                    }
                }
            }
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    writable: bool,
    uuid: Uuid,
    revision: u64,
    state: State,
    dirty: bool,
    txn_backup: Option<(State, bool)>,
}

impl Index {
    /// Whether an index snapshot exists under this shard directory.
    pub fn exists(path: &Path) -> bool {
        path.join(SNAPSHOT_FILE).exists()
    }

    pub fn open(path: &Path, mode: OpenMode, writable: bool) -> Result<Index> {
        let snapshot = path.join(SNAPSHOT_FILE);
        let exists = snapshot.exists();
        match mode {
            OpenMode::Open if !exists => {
                return Err(Error::NotFound(format!(
                    "database not found: {}",
                    path.display()
                )));
            }
            OpenMode::Create if exists => {
                return Err(Error::InvalidArgument(format!(
                    "database already exists: {}",
                    path.display()
                )));
            }
            OpenMode::CreateOrOverwrite => {
                return Index::create(path, writable);
            }
            OpenMode::Create | OpenMode::CreateOrOpen if !exists => {
                return Index::create(path, writable);
            }
            _ => {}
        }

        let (uuid, revision, state) = load_snapshot(&snapshot)?;
        Ok(Index {
            path: path.to_path_buf(),
            writable,
            uuid,
            revision,
            state,
            dirty: false,
            txn_backup: None,
        })
    }

    fn create(path: &Path, writable: bool) -> Result<Index> {
        fs::create_dir_all(path)
            .map_err(|e| Error::Opening(format!("{}: {e}", path.display())))?;
        let index = Index {
            path: path.to_path_buf(),
            writable,
            uuid: Uuid::new_v4(),
            revision: 0,
            state: State::default(),
            dirty: false,
            txn_backup: None,
        };
        write_snapshot(&index.path.join(SNAPSHOT_FILE), index.uuid, 0, &index.state)?;
        Ok(index)
    }

    /// Reloads the snapshot when a newer revision is on disk. Returns true
    /// if the in-memory state changed.
    pub fn reopen(&mut self) -> Result<bool> {
        let snapshot = self.path.join(SNAPSHOT_FILE);
        let disk = read_disk_revision(&snapshot)?;
        if disk == self.revision {
            return Ok(false);
        }
        let (uuid, revision, state) = load_snapshot(&snapshot)?;
        if uuid != self.uuid {
            return Err(Error::Opening(format!(
                "index replaced underneath: {}",
                self.path.display()
            )));
        }
        self.revision = revision;
        self.state = state;
        self.dirty = false;
        Ok(true)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn doc_count(&self) -> usize {
        self.state.documents.len()
    }

    pub fn get_lastdocid(&self) -> DocId {
        self.state.next_did
    }

    fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::InvalidArgument("index is read-only".into()))
        }
    }

    /// Writes a snapshot at revision + 1. No-op (returning `None`) when
    /// there is nothing to flush.
    pub fn commit(&mut self) -> Result<Option<PathBuf>> {
        self.require_writable()?;
        if !self.dirty {
            return Ok(None);
        }
        let snapshot = self.path.join(SNAPSHOT_FILE);
        write_snapshot(&snapshot, self.uuid, self.revision + 1, &self.state)?;
        self.revision += 1;
        self.dirty = false;
        Ok(Some(snapshot))
    }

    /// Commit used by WAL replay: flushes even when the replayed records
    /// left nothing dirty, so the revision tracks the log.
    pub fn commit_for_replay(&mut self) -> Result<Option<PathBuf>> {
        self.dirty = true;
        self.commit()
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.require_writable()?;
        if self.txn_backup.is_some() {
            return Err(Error::InvalidArgument("transaction already started".into()));
        }
        self.txn_backup = Some((self.state.clone(), self.dirty));
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        self.require_writable()?;
        self.txn_backup = None;
        Ok(())
    }

    pub fn cancel_transaction(&mut self) -> Result<()> {
        self.require_writable()?;
        if let Some((state, dirty)) = self.txn_backup.take() {
            self.state = state;
            self.dirty = dirty;
        }
        Ok(())
    }

    pub fn add_document(&mut self, doc: Document) -> Result<DocId> {
        self.require_writable()?;
        let did = self.state.next_did + 1;
        self.state.insert_doc(did, doc);
        self.dirty = true;
        Ok(did)
    }

    pub fn replace_document(&mut self, did: DocId, doc: Document) -> Result<()> {
        self.require_writable()?;
        if did == 0 {
            return Err(Error::InvalidArgument("docid 0 is invalid".into()));
        }
        self.state.insert_doc(did, doc);
        self.dirty = true;
        Ok(())
    }

    pub fn replace_document_by_term(&mut self, term: &[u8], doc: Document) -> Result<DocId> {
        self.require_writable()?;
        let did = match self.postlist_first(term) {
            Some(did) => did,
            None => self.state.next_did + 1,
        };
        self.state.insert_doc(did, doc);
        self.dirty = true;
        Ok(did)
    }

    pub fn delete_document(&mut self, did: DocId) -> Result<()> {
        self.require_writable()?;
        if !self.state.remove_doc(did) {
            return Err(Error::NotFound(format!("document {did} not found")));
        }
        self.dirty = true;
        Ok(())
    }

    /// Deletes every document indexed by `term`; silently does nothing
    /// when there are none.
    pub fn delete_document_by_term(&mut self, term: &[u8]) -> Result<()> {
        self.require_writable()?;
        let dids: Vec<DocId> = self.postlist(term);
        for did in dids {
            self.state.remove_doc(did);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn get_document(&self, did: DocId) -> Result<Document> {
        self.state
            .documents
            .get(&did)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document {did} not found")))
    }

    pub fn postlist(&self, term: &[u8]) -> Vec<DocId> {
        self.state
            .postings
            .get(term)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn postlist_first(&self, term: &[u8]) -> Option<DocId> {
        self.state
            .postings
            .get(term)
            .and_then(|set| set.iter().next().copied())
    }

    /// Sorted terms starting with `prefix`.
    pub fn allterms(&self, prefix: &[u8]) -> Vec<Term> {
        self.state
            .postings
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(term, _)| term.starts_with(prefix))
            .map(|(term, _)| term.clone())
            .collect()
    }

    pub fn documents(&self) -> impl Iterator<Item = (&DocId, &Document)> {
        self.state.documents.iter()
    }

    /// Empty result for a missing key, matching backend semantics.
    pub fn get_metadata(&self, key: &[u8]) -> Vec<u8> {
        self.state.metadata.get(key).cloned().unwrap_or_default()
    }

    pub fn metadata_keys(&self) -> Vec<Vec<u8>> {
        self.state.metadata.keys().cloned().collect()
    }

    pub fn set_metadata(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_writable()?;
        if value.is_empty() {
            self.state.metadata.remove(key);
        } else {
            self.state.metadata.insert(key.to_vec(), value.to_vec());
        }
        self.dirty = true;
        Ok(())
    }

    pub fn add_spelling(&mut self, word: &[u8], freqinc: u32) -> Result<()> {
        self.require_writable()?;
        *self.state.spelling.entry(word.to_vec()).or_insert(0) += freqinc;
        self.dirty = true;
        Ok(())
    }

    /// Returns the remaining frequency for the word.
    pub fn remove_spelling(&mut self, word: &[u8], freqdec: u32) -> Result<u32> {
        self.require_writable()?;
        let remaining = match self.state.spelling.get_mut(word) {
            Some(freq) => {
                *freq = freq.saturating_sub(freqdec);
                *freq
            }
            None => 0,
        };
        if remaining == 0 {
            self.state.spelling.remove(word);
        }
        self.dirty = true;
        Ok(remaining)
    }

    pub fn get_spelling(&self, word: &[u8]) -> u32 {
        self.state.spelling.get(word).copied().unwrap_or(0)
    }
}

/// Reads only the snapshot header, without decoding the body.
pub fn read_disk_revision(snapshot: &Path) -> Result<u64> {
    let mut file = fs::File::open(snapshot)
        .map_err(|e| Error::Opening(format!("{}: {e}", snapshot.display())))?;
    let mut header = [0u8; 32];
    file.read_exact(&mut header)
        .map_err(|e| Error::Opening(format!("{}: {e}", snapshot.display())))?;
    if &header[..8] != SNAPSHOT_MAGIC {
        return Err(Error::Opening(format!(
            "bad index magic: {}",
            snapshot.display()
        )));
    }
    Ok(u64::from_le_bytes(header[24..32].try_into().unwrap()))
}

fn write_snapshot(snapshot: &Path, uuid: Uuid, revision: u64, state: &State) -> Result<()> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.extend_from_slice(uuid.as_bytes());
    buf.put_u64_le(revision);

    buf.put_u32(state.next_did);
    buf.extend_from_slice(&serialise_length(state.documents.len() as u64));
    for (did, doc) in &state.documents {
        let doc_bytes = doc.serialise();
        buf.put_u32(*did);
        buf.put_u32(doc_bytes.len() as u32);
        buf.extend_from_slice(&doc_bytes);
    }
    buf.extend_from_slice(&serialise_length(state.metadata.len() as u64));
    for (key, value) in &state.metadata {
        buf.extend_from_slice(&serialise_length(key.len() as u64));
        buf.extend_from_slice(key);
        buf.extend_from_slice(&serialise_length(value.len() as u64));
        buf.extend_from_slice(value);
    }
    buf.extend_from_slice(&serialise_length(state.spelling.len() as u64));
    for (word, freq) in &state.spelling {
        buf.extend_from_slice(&serialise_length(word.len() as u64));
        buf.extend_from_slice(word);
        buf.extend_from_slice(&serialise_length(u64::from(*freq)));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.put_u32(crc);

    // Atomic replace so readers never observe a torn snapshot.
    let tmp = snapshot.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_data()?;
    }
    fs::rename(&tmp, snapshot)?;
    Ok(())
}

fn load_snapshot(snapshot: &Path) -> Result<(Uuid, u64, State)> {
    let bytes = fs::read(snapshot)
        .map_err(|e| Error::Opening(format!("{}: {e}", snapshot.display())))?;
    if bytes.len() < 36 || &bytes[..8] != SNAPSHOT_MAGIC {
        return Err(Error::Opening(format!(
            "bad index snapshot: {}",
            snapshot.display()
        )));
    }
    let body = &bytes[..bytes.len() - 4];
    let stored_crc = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(Error::Opening(format!(
            "index snapshot checksum mismatch: {}",
            snapshot.display()
        )));
    }

    let uuid = Uuid::from_slice(&bytes[8..24])
        .map_err(|e| Error::Opening(format!("bad index uuid: {e}")))?;
    let revision = u64::from_le_bytes(bytes[24..32].try_into().unwrap());

    let mut state = State::default();
    let mut cursor = &body[32..];
    let mut cur = cursor;
    state.next_did = cur.get_u32();
    cursor = cur;

    let (doc_count, n) = unserialise_length(cursor)?;
    cursor = &cursor[n..];
    for _ in 0..doc_count {
        let mut cur = cursor;
        let did = cur.get_u32();
        let len = cur.get_u32() as usize;
        cursor = cur;
        if cursor.len() < len {
            return Err(Error::Opening("truncated index snapshot".into()));
        }
        let doc = Document::unserialise(&cursor[..len])
            .map_err(|e| Error::Opening(format!("bad document in snapshot: {e}")))?;
        cursor = &cursor[len..];
        state.insert_doc(did, doc);
    }

    let (meta_count, n) = unserialise_length(cursor)?;
    cursor = &cursor[n..];
    for _ in 0..meta_count {
        let (klen, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        let key = cursor[..klen as usize].to_vec();
        cursor = &cursor[klen as usize..];
        let (vlen, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        let value = cursor[..vlen as usize].to_vec();
        cursor = &cursor[vlen as usize..];
        state.metadata.insert(key, value);
    }

    let (spell_count, n) = unserialise_length(cursor)?;
    cursor = &cursor[n..];
    for _ in 0..spell_count {
        let (wlen, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        let word = cursor[..wlen as usize].to_vec();
        cursor = &cursor[wlen as usize..];
        let (freq, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        state.spelling.insert(word, freq as u32);
    }

    Ok((uuid, revision, state))
}
