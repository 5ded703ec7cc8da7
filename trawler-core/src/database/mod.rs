//! Multi-shard database: N checked-out shards presented as one logical
//! index.
//!
//! Document ids interleave across shards: global id
//! `(local - 1) * n_shards + shard_num + 1`. Broadcast operations tolerate
//! partial failure as long as at least one shard succeeded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::backend::matcher::Match;
use crate::backend::{DocId, Document, DB_SLOT_SHARDS};
use crate::endpoint::Endpoints;
use crate::errors::{Error, Result};
use crate::flags::OpenFlags;
use crate::query::sort::KeyMaker;
use crate::query::Query;
use crate::serialise::{fnv1a64, sortable_unserialise, unserialise_string_at};
use crate::shard::{serialise_shards_hint, Shard};
use crate::storage::{Locator, LocatorType, STORED_BLOB, STORED_CONTENT_TYPE};

/// Attempts at finding an active node when picking a shard for a fresh
/// document; falls back to the last pick.
const ACTIVE_NODE_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseMatch {
    pub docid: u64,
    pub weight: f64,
}

pub struct Database {
    closed: AtomicBool,
    shards: Vec<Arc<Shard>>,
    pub endpoints: Endpoints,
    pub flags: OpenFlags,
}

impl Database {
    pub fn new(shards: Vec<Arc<Shard>>, endpoints: Endpoints, flags: OpenFlags) -> Database {
        debug_assert!(!shards.is_empty());
        Database {
            closed: AtomicBool::new(false),
            shards,
            endpoints,
            flags,
        }
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn into_shards(self) -> Vec<Arc<Shard>> {
        self.shards
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    fn route_did(&self, did: u64) -> (usize, DocId) {
        let n = self.shards.len() as u64;
        let shard_num = ((did - 1) % n) as usize;
        let shard_did = ((did - 1) / n + 1) as DocId;
        (shard_num, shard_did)
    }

    fn global_did(&self, shard_num: usize, shard_did: DocId) -> u64 {
        (u64::from(shard_did) - 1) * self.shards.len() as u64 + shard_num as u64 + 1
    }

    /// Picks a random shard whose node is active, trying a bounded number
    /// of times before silently settling for the last pick.
    fn pick_active_shard(&self) -> usize {
        let n = self.shards.len();
        if n <= 1 {
            return 0;
        }
        let mut rng = rand::thread_rng();
        let mut pick = 0;
        for attempt in 0..=ACTIVE_NODE_ATTEMPTS {
            pick = rng.gen_range(0..n);
            match self.shards[pick].endpoint().endpoint.node.as_ref() {
                None => return pick,
                Some(node) if node.is_active() => return pick,
                Some(_) => {
                    if attempt == ACTIVE_NODE_ATTEMPTS {
                        tracing::debug!("no active node found, using last pick");
                    }
                }
            }
        }
        pick
    }

    /// Runs `op` on every shard, tolerating transient failures as long as
    /// at least one shard succeeds; the last error surfaces otherwise.
    fn broadcast<T>(&self, mut op: impl FnMut(&Arc<Shard>) -> Result<T>) -> Result<Vec<T>> {
        debug_assert!(!self.shards.is_empty());
        let mut valid = self.shards.len();
        let mut last_error = None;
        let mut results = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            match op(shard) {
                Ok(value) => results.push(value),
                Err(e) if e.is_transient() => {
                    last_error = Some(e);
                    valid -= 1;
                }
                Err(e) => return Err(e),
            }
        }
        if valid == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(results)
    }

    pub fn reopen(&self) -> Result<()> {
        self.check_open()?;
        self.broadcast(|shard| shard.reopen())?;
        Ok(())
    }

    /// Joined shard UUIDs, mirroring the composite identity.
    pub fn get_uuid_string(&self) -> Result<String> {
        let uuids = self.broadcast(|shard| shard.db_uuid().map(|u| u.to_string()))?;
        Ok(uuids.join(";"))
    }

    pub fn get_revision(&self) -> Result<u64> {
        let revisions = self.broadcast(|shard| shard.db_revision())?;
        Ok(revisions.into_iter().max().unwrap_or(0))
    }

    pub fn commit(&self, wal: bool, send_update: bool) -> Result<bool> {
        self.check_open()?;
        let results = self.broadcast(|shard| shard.commit(wal, send_update))?;
        Ok(results.into_iter().any(|committed| committed))
    }

    pub fn begin_transaction(&self, flushed: bool) -> Result<()> {
        self.check_open()?;
        self.broadcast(|shard| shard.begin_transaction(flushed))?;
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.check_open()?;
        self.broadcast(|shard| shard.commit_transaction())?;
        Ok(())
    }

    pub fn cancel_transaction(&self) -> Result<()> {
        self.check_open()?;
        self.broadcast(|shard| shard.cancel_transaction())?;
        Ok(())
    }

    pub fn delete_document(
        &self,
        did: u64,
        commit: bool,
        wal: bool,
        version: Option<u64>,
    ) -> Result<()> {
        self.check_open()?;
        let (shard_num, shard_did) = self.route_did(did);
        self.shards[shard_num].delete_document(shard_did, commit, wal, version)
    }

    pub fn delete_document_term(
        &self,
        term: &[u8],
        commit: bool,
        wal: bool,
        version: Option<u64>,
    ) -> Result<()> {
        self.check_open()?;
        let shard_num = (fnv1a64(term) % self.shards.len() as u64) as usize;
        self.shards[shard_num].delete_document_term(term, commit, wal, version)
    }

    pub fn add_document(&self, doc: Document, commit: bool, wal: bool) -> Result<u64> {
        self.check_open()?;
        let shard_num = self.pick_active_shard();
        let shard_did = self.shards[shard_num].add_document(doc, commit, wal)?;
        Ok(self.global_did(shard_num, shard_did))
    }

    pub fn replace_document(
        &self,
        did: u64,
        doc: Document,
        commit: bool,
        wal: bool,
        version_check: bool,
    ) -> Result<u64> {
        self.check_open()?;
        let (shard_num, shard_did) = self.route_did(did);
        self.shards[shard_num].replace_document(shard_did, doc, commit, wal, version_check)?;
        Ok(did)
    }

    pub fn replace_document_term(
        &self,
        term: &[u8],
        mut doc: Document,
        commit: bool,
        wal: bool,
        version_check: bool,
    ) -> Result<u64> {
        self.check_open()?;
        let n_shards = self.shards.len();
        let mut shard_num = 0;
        if n_shards > 1 {
            if term.starts_with(b"QN") {
                let did = sortable_unserialise(&term[2..]) as u64;
                if did == 0 {
                    // Sentinel id: the shard assigns a fresh one from the
                    // shards hint.
                    shard_num = self.pick_active_shard();
                    doc.add_value(
                        DB_SLOT_SHARDS,
                        serialise_shards_hint(shard_num as u64, n_shards as u64),
                    );
                } else {
                    shard_num = ((did - 1) % n_shards as u64) as usize;
                }
            } else {
                shard_num = (fnv1a64(term) % n_shards as u64) as usize;
            }
        }
        let shard_did =
            self.shards[shard_num].replace_document_term(term, doc, commit, wal, version_check)?;
        Ok(self.global_did(shard_num, shard_did))
    }

    pub fn add_spelling(&self, word: &[u8], freqinc: u32, commit: bool, wal: bool) -> Result<()> {
        self.check_open()?;
        self.broadcast(|shard| shard.add_spelling(word, freqinc, commit, wal))?;
        Ok(())
    }

    pub fn remove_spelling(
        &self,
        word: &[u8],
        freqdec: u32,
        commit: bool,
        wal: bool,
    ) -> Result<u32> {
        self.check_open()?;
        let results = self.broadcast(|shard| shard.remove_spelling(word, freqdec, commit, wal))?;
        Ok(results.into_iter().last().unwrap_or(0))
    }

    /// First document carrying the term, as a global id.
    pub fn find_document(&self, term: &[u8]) -> Result<u64> {
        self.check_open()?;
        let mut valid = self.shards.len();
        let mut last_error = None;
        for (shard_num, shard) in self.shards.iter().enumerate() {
            match shard.get_docid_term(term) {
                Ok(shard_did) => return Ok(self.global_did(shard_num, shard_did)),
                Err(Error::NotFound(_)) => {}
                Err(e) if e.is_transient() => {
                    last_error = Some(e);
                    valid -= 1;
                }
                Err(e) => return Err(e),
            }
        }
        if valid == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Err(Error::NotFound("document not found".into()))
    }

    pub fn get_document(&self, did: u64) -> Result<Document> {
        self.check_open()?;
        let (shard_num, shard_did) = self.route_did(did);
        self.shards[shard_num].get_document(shard_did)
    }

    pub fn storage_get_stored(&self, locator: &Locator, did: u64) -> Result<Vec<u8>> {
        self.check_open()?;
        let (shard_num, _) = self.route_did(did);
        self.shards[shard_num].storage_get_stored(locator)
    }

    /// First non-empty value wins.
    pub fn get_metadata(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut valid = self.shards.len();
        let mut last_error = None;
        for shard in &self.shards {
            match shard.get_metadata(key) {
                Ok(value) if !value.is_empty() => return Ok(value),
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    last_error = Some(e);
                    valid -= 1;
                }
                Err(e) => return Err(e),
            }
        }
        if valid == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(Vec::new())
    }

    /// Union across shards.
    pub fn get_metadata_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        let per_shard = self.broadcast(|shard| shard.get_metadata_keys())?;
        let mut keys: Vec<Vec<u8>> = per_shard.into_iter().flatten().collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn set_metadata(&self, key: &[u8], value: &[u8], commit: bool, wal: bool) -> Result<()> {
        self.check_open()?;
        self.broadcast(|shard| shard.set_metadata(key, value, commit, wal))?;
        Ok(())
    }

    /// Fans the query out to every shard and merges the result sets. A
    /// shard failure is tolerated only if at least one shard answered.
    pub fn search(
        &self,
        query: &Query,
        sort: Option<&KeyMaker>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DatabaseMatch>> {
        self.check_open()?;
        let fetch = offset.saturating_add(limit);
        let mut valid = self.shards.len();
        let mut last_error = None;
        let mut merged: Vec<(Option<Vec<u8>>, Match, usize)> = Vec::new();
        for (shard_num, shard) in self.shards.iter().enumerate() {
            match shard.search(query, sort, 0, fetch) {
                Ok(matches) => {
                    for m in matches {
                        merged.push((m.sort_key.clone(), m, shard_num));
                    }
                }
                Err(e) if e.is_transient() => {
                    last_error = Some(e);
                    valid -= 1;
                }
                Err(e) => return Err(e),
            }
        }
        if valid == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        if sort.is_some() {
            merged.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.docid.cmp(&b.1.docid)));
        } else {
            merged.sort_by(|a, b| {
                b.1.weight
                    .partial_cmp(&a.1.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.docid.cmp(&b.1.docid))
            });
        }

        Ok(merged
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, m, shard_num)| DatabaseMatch {
                docid: self.global_did(shard_num, m.docid),
                weight: m.weight,
            })
            .collect())
    }

    /// Re-serialises every document's data object, resolving stored blobs
    /// back out of blob storage.
    pub fn dump_documents(&self) -> Result<Vec<serde_json::Value>> {
        self.check_open()?;
        let mut docs = Vec::new();
        for (shard_num, shard) in self.shards.iter().enumerate() {
            let lastdocid = shard.get_lastdocid()?;
            for shard_did in 1..=lastdocid {
                let doc = match shard.get_document(shard_did) {
                    Ok(doc) => doc,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let global = self.global_did(shard_num, shard_did);
                docs.push(self.dump_document(shard_num, global, &doc)?);
            }
        }
        Ok(docs)
    }

    fn dump_document(
        &self,
        shard_num: usize,
        global_did: u64,
        doc: &Document,
    ) -> Result<serde_json::Value> {
        let data = crate::storage::Data::from_serialised(doc.get_data())?;
        let mut obj = data.get_obj()?;
        if obj.is_null() {
            obj = serde_json::json!({});
        }
        let mut blobs = Vec::new();
        for locator in data.iter() {
            match locator.ty {
                LocatorType::Inplace | LocatorType::CompressedInplace => {
                    if !locator.ct_type.is_empty() {
                        blobs.push(serde_json::json!({
                            "_content_type": locator.ct_type,
                            "_type": "inplace",
                            "_blob": locator.data()?,
                        }));
                    }
                }
                LocatorType::Stored | LocatorType::CompressedStored => {
                    let stored = self.shards[shard_num].storage_get_stored(locator)?;
                    let mut blob = unserialise_string_at(STORED_BLOB, &stored)?;
                    if locator.ty.is_compressed() {
                        blob = lz4_flex::decompress_size_prepended(&blob).map_err(|e| {
                            Error::CorruptVolume(format!("stored blob decompression failed: {e}"))
                        })?;
                    }
                    blobs.push(serde_json::json!({
                        "_content_type": String::from_utf8_lossy(
                            &unserialise_string_at(STORED_CONTENT_TYPE, &stored)?
                        ),
                        "_type": "stored",
                        "_blob": blob,
                    }));
                }
            }
        }
        if !blobs.is_empty() {
            obj["_data"] = serde_json::Value::Array(blobs);
        }
        obj["_id"] = serde_json::Value::from(global_did);
        Ok(obj)
    }

    pub fn dump_metadata(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.check_open()?;
        let mut out = BTreeMap::new();
        for key in self.get_metadata_keys()? {
            let value = self.get_metadata(&key)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
