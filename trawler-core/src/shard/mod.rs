//! One physical index shard: the backend handle plus its WAL and blob
//! storage, with the retry discipline for transient backend errors.
//!
//! A shard is checked out to at most one caller at a time (`busy` CAS).
//! Every mutating call lands in the WAL before returning; a dirty checkin
//! debounces a commit through the committer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::backend::{
    DocId, Document, Index, OpenMode, DB_SLOT_ID, DB_SLOT_SHARDS, DB_SLOT_VERSION,
};
use crate::backend::matcher::Match;
use crate::engine::{DataPlane, FsyncMode};
use crate::errors::{Error, Result};
use crate::flags::OpenFlags;
use crate::pool::ShardEndpoint;
use crate::query::sort::KeyMaker;
use crate::query::Query;
use crate::serialise::{
    serialise_length, serialise_strings, sortable_serialise, sortable_unserialise,
    unserialise_length,
};
use crate::storage::{BlobStorage, Data, Locator};
use crate::wal::DatabaseWal;

/// Key of the document id inside the serialized data object.
const ID_FIELD_NAME: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    None,
    Flushed,
    Unflushed,
}

#[derive(Debug)]
pub struct Shard {
    endpoint: Arc<ShardEndpoint>,
    context: Weak<DataPlane>,
    flags: AtomicU32,
    busy: AtomicBool,
    local: AtomicBool,
    closed: AtomicBool,
    modified: AtomicBool,
    incomplete: AtomicBool,
    transaction: Mutex<Transaction>,
    reopen_time: Mutex<Instant>,
    reopen_revision: AtomicU64,
    db: Mutex<Option<Index>>,
    wal: Mutex<Option<DatabaseWal>>,
    storage: Mutex<Option<BlobStorage>>,
    writable_storage: Mutex<Option<BlobStorage>>,
}

impl Shard {
    pub fn new(endpoint: Arc<ShardEndpoint>, flags: OpenFlags) -> Arc<Shard> {
        Arc::new(Shard {
            context: endpoint.context(),
            endpoint,
            flags: AtomicU32::new(flags.bits()),
            busy: AtomicBool::new(false),
            local: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            modified: AtomicBool::new(false),
            incomplete: AtomicBool::new(false),
            transaction: Mutex::new(Transaction::None),
            reopen_time: Mutex::new(Instant::now()),
            reopen_revision: AtomicU64::new(0),
            db: Mutex::new(None),
            wal: Mutex::new(None),
            storage: Mutex::new(None),
            writable_storage: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Arc<ShardEndpoint> {
        &self.endpoint
    }

    pub fn flags(&self) -> OpenFlags {
        OpenFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: OpenFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_writable(&self) -> bool {
        self.flags().is_writable()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Returns the previous value; a `false` return means the caller now
    /// owns the shard.
    pub fn busy_swap(&self, value: bool) -> bool {
        self.busy.swap(value, Ordering::AcqRel)
    }

    pub fn release_busy(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_local(&self) -> bool {
        self.local.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete.load(Ordering::Acquire)
    }

    pub fn reopen_time(&self) -> Instant {
        *self.reopen_time.lock()
    }

    pub fn reopen_revision(&self) -> u64 {
        self.reopen_revision.load(Ordering::Acquire)
    }

    pub fn transaction(&self) -> Transaction {
        *self.transaction.lock()
    }

    fn retries(&self) -> usize {
        self.endpoint.config().db_retries
    }

    pub fn is_wal_active(&self) -> bool {
        self.is_writable() && self.is_local() && !self.flags().contains(OpenFlags::DISABLE_WAL)
    }

    fn context(&self) -> Option<Arc<DataPlane>> {
        self.context.upgrade()
    }

    // ------------------------------------------------------------------
    // Lifecycle

    fn reset(&self) {
        *self.db.lock() = None;
        self.reopen_revision.store(0, Ordering::Release);
        self.local.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.modified.store(false, Ordering::Release);
        self.incomplete.store(false, Ordering::Release);
        *self.storage.lock() = None;
        *self.writable_storage.lock() = None;
        *self.wal.lock() = None;
    }

    fn open_mode(&self) -> OpenMode {
        let flags = self.flags();
        if flags.contains(OpenFlags::CREATE_OR_OVERWRITE) {
            OpenMode::CreateOrOverwrite
        } else if flags.contains(OpenFlags::CREATE_OR_OPEN) {
            OpenMode::CreateOrOpen
        } else if flags.contains(OpenFlags::CREATE) {
            OpenMode::Create
        } else {
            OpenMode::Open
        }
    }

    fn reopen_writable(&self) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::DatabaseClosed);
        }
        self.reset();

        let endpoint = &self.endpoint.endpoint;
        let (index, local, created) = if endpoint.is_local() {
            tracing::debug!(%endpoint, "opening local writable shard");
            let created = !Index::exists(&endpoint.path);
            let index = Index::open(&endpoint.path, self.open_mode(), true)?;
            (index, true, created)
        } else {
            let node = endpoint.node.as_ref().unwrap();
            if !node.is_active() {
                return Err(Error::Network("endpoint node is inactive".into()));
            }
            if node.remote_port == 0 {
                return Err(Error::Network("endpoint node without a valid port".into()));
            }
            // Writable remote shards have no local fallback.
            return Err(Error::Network(format!(
                "remote backend is not reachable: {endpoint}"
            )));
        };

        self.local.store(local, Ordering::Release);
        if local {
            self.reopen_revision.store(index.revision(), Ordering::Release);
            self.endpoint
                .local_revision
                .store(index.revision(), Ordering::Release);
        }

        let uuid = index.uuid();
        *self.db.lock() = Some(index);

        if self.transaction() != Transaction::None {
            if let Some(index) = self.db.lock().as_mut() {
                index.begin_transaction()?;
            }
        }

        if local {
            let cap = self.endpoint.config().blob_volume_cap;
            *self.writable_storage.lock() =
                Some(BlobStorage::new(&endpoint.path, uuid, true, cap));
            *self.storage.lock() = Some(BlobStorage::new(&endpoint.path, uuid, false, cap));
        }

        if self.is_wal_active() {
            let config = self.endpoint.config();
            let wal = DatabaseWal::open(
                &endpoint.path,
                self.flags().contains(OpenFlags::SYNCHRONOUS_WAL),
                config.wal_volume_cap,
            );
            *self.wal.lock() = Some(wal);
            if self.wal_replay()? {
                self.modified.store(true, Ordering::Release);
            }
        }

        *self.reopen_time.lock() = Instant::now();
        Ok(created)
    }

    fn reopen_readable(&self) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::DatabaseClosed);
        }
        self.reset();

        let endpoint = &self.endpoint.endpoint;
        let (index, local, created) = if endpoint.is_local() {
            tracing::debug!(%endpoint, "opening local shard");
            let created = !Index::exists(&endpoint.path);
            let index = Index::open(&endpoint.path, self.open_mode(), false)?;
            (index, true, created)
        } else {
            let node = endpoint.node.as_ref().unwrap();
            if !node.is_active() {
                return Err(Error::Network("endpoint node is inactive".into()));
            }
            if node.remote_port == 0 {
                return Err(Error::Network("endpoint node without a valid port".into()));
            }
            if Index::exists(&endpoint.path) {
                // Local fallback: serve the local copy and ask the master
                // to freshen it, since its generation cannot be verified.
                tracing::debug!(%endpoint, "remote endpoint fallback to local shard");
                let index = Index::open(&endpoint.path, OpenMode::Open, false)?;
                if let Some(ctx) = self.context() {
                    let local_copy = crate::endpoint::Endpoint::local(endpoint.path.clone());
                    ctx.events.trigger_replication(endpoint, &local_copy);
                }
                self.incomplete.store(true, Ordering::Release);
                (index, true, false)
            } else {
                return Err(Error::Network(format!(
                    "remote backend is not reachable: {endpoint}"
                )));
            }
        };

        self.local.store(local, Ordering::Release);
        if local {
            self.reopen_revision.store(index.revision(), Ordering::Release);
        }

        let uuid = index.uuid();
        *self.db.lock() = Some(index);

        if local {
            let cap = self.endpoint.config().blob_volume_cap;
            *self.storage.lock() = Some(BlobStorage::new(&endpoint.path, uuid, false, cap));
        }

        *self.reopen_time.lock() = Instant::now();
        Ok(created)
    }

    /// (Re)opens the backend handle, replaying the WAL for local writable
    /// shards. Returns true if the shard was (re)built.
    pub fn reopen(&self) -> Result<bool> {
        {
            let mut guard = self.db.lock();
            if let Some(index) = guard.as_mut() {
                if !self.is_incomplete() {
                    match index.reopen() {
                        Ok(_) => {
                            if self.is_local() {
                                self.reopen_revision
                                    .store(index.revision(), Ordering::Release);
                            }
                            return Ok(false);
                        }
                        Err(e) if e.is_transient() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        self.do_close_inner(true, self.is_closed());

        let mut last_error = None;
        for _ in 0..=self.retries() {
            let result = if self.is_writable() {
                self.reopen_writable()
            } else {
                self.reopen_readable()
            };
            match result {
                Ok(_) => return Ok(true),
                Err(Error::DatabaseModified) => {
                    last_error = Some(Error::DatabaseModified);
                }
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::DatabaseClosed))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::DatabaseClosed);
        }
        if self.db.lock().is_none() {
            self.reopen()?;
        }
        Ok(())
    }

    pub fn db_revision(&self) -> Result<u64> {
        self.ensure_open()?;
        let guard = self.db.lock();
        guard
            .as_ref()
            .map(|index| index.revision())
            .ok_or(Error::DatabaseClosed)
    }

    pub fn db_uuid(&self) -> Result<uuid::Uuid> {
        self.ensure_open()?;
        let guard = self.db.lock();
        guard
            .as_ref()
            .map(|index| index.uuid())
            .ok_or(Error::DatabaseClosed)
    }

    fn do_close_inner(&self, commit: bool, closed: bool) {
        let transaction = self.transaction();
        if commit
            && transaction == Transaction::None
            && !self.is_closed()
            && self.is_modified()
            && self.is_writable()
            && self.is_local()
            && self.db.lock().is_some()
        {
            if let Err(e) = self.commit(true, true) {
                tracing::warn!(endpoint = %self.endpoint.endpoint, error = %e, "commit during close failed");
            }
        }

        let local = self.is_local();
        self.reset();
        self.local.store(local, Ordering::Release);
        self.closed.store(closed, Ordering::Release);
        *self.transaction.lock() = transaction;
    }

    /// Close used by the pool when tearing down idle shards; errors are
    /// logged, never surfaced.
    pub fn do_close_quiet(&self, commit: bool) {
        self.do_close_inner(commit, self.is_closed());
    }

    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.do_close_inner(true, true);
        *self.transaction.lock() = Transaction::None;
    }

    /// Debounces a commit for a dirty writable shard through the
    /// committer; a no-op for clean, remote or closed shards.
    pub fn autocommit(shard: &Arc<Shard>) {
        if shard.db.lock().is_some()
            && shard.transaction() == Transaction::None
            && !shard.is_closed()
            && shard.is_modified()
            && shard.is_writable()
            && shard.is_local()
        {
            if let Some(ctx) = shard.context() {
                ctx.committer
                    .debounce(shard.endpoint.endpoint.clone(), Arc::downgrade(shard));
            }
        }
    }

    // ------------------------------------------------------------------
    // Retry plumbing

    /// Runs `body` against the open index, retrying transient failures
    /// with a full close-and-reopen, up to the configured retry count. A
    /// terminal failure closes the shard.
    fn with_index_retry<T>(&self, body: impl FnMut(&mut Index) -> Result<T>) -> Result<T> {
        self.with_index_retry_opts(true, body)
    }

    fn with_index_retry_opts<T>(
        &self,
        commit_on_terminal_close: bool,
        mut body: impl FnMut(&mut Index) -> Result<T>,
    ) -> Result<T> {
        let retries = self.retries();
        for t in (0..=retries).rev() {
            let attempt = (|| {
                self.ensure_open()?;
                let mut guard = self.db.lock();
                match guard.as_mut() {
                    Some(index) => body(index),
                    None => Err(Error::DatabaseClosed),
                }
            })();
            match attempt {
                Ok(value) => {
                    if t != retries {
                        tracing::debug!(
                            endpoint = %self.endpoint.endpoint,
                            retries = retries - t,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    if t == 0 {
                        self.do_close_inner(commit_on_terminal_close, true);
                        return Err(e);
                    }
                    self.do_close_inner(false, self.is_closed());
                }
                // Version conflicts, not-found and invalid-argument errors
                // surface immediately and leave the shard untouched.
                Err(
                    e @ (Error::NotFound(_)
                    | Error::VersionConflict(_)
                    | Error::InvalidArgument(_)
                    | Error::Serialisation(_)
                    | Error::QueryDsl(_)
                    | Error::StorageNotFound
                    | Error::StorageEof),
                ) => {
                    return Err(e);
                }
                Err(e) => {
                    self.do_close_inner(false, self.is_closed());
                    return Err(e);
                }
            }
            if let Err(e) = self.reopen() {
                if !e.is_transient() {
                    return Err(e);
                }
            }
        }
        unreachable!("retry loop always returns");
    }

    // ------------------------------------------------------------------
    // WAL

    fn wal_replay(&self) -> Result<bool> {
        let records = {
            let wal_guard = self.wal.lock();
            let wal = match wal_guard.as_ref() {
                Some(wal) => wal,
                None => return Ok(false),
            };
            let revision = self
                .db
                .lock()
                .as_ref()
                .map(|index| index.revision())
                .unwrap_or(0);
            wal.records_after(revision)?
        };
        if records.is_empty() {
            return Ok(false);
        }

        tracing::debug!(
            endpoint = %self.endpoint.endpoint,
            records = records.len(),
            "replaying write-ahead log"
        );

        let mut modified = false;
        for record in records {
            use crate::wal::WalOp::*;
            match record.op {
                Commit => {
                    let mut guard = self.db.lock();
                    let index = guard.as_mut().ok_or(Error::DatabaseClosed)?;
                    index.commit_for_replay()?;
                    self.endpoint
                        .local_revision
                        .store(index.revision(), Ordering::Release);
                    modified = false;
                }
                AddDocument { doc } => {
                    let doc = self.replay_document(doc)?;
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .add_document(doc)?;
                    modified = true;
                }
                DeleteDocumentId { did } => {
                    let mut guard = self.db.lock();
                    match guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .delete_document(did)
                    {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                    modified = true;
                }
                DeleteDocumentTerm { term } => {
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .delete_document_by_term(&term)?;
                    modified = true;
                }
                ReplaceDocumentId { did, doc } => {
                    let doc = self.replay_document(doc)?;
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .replace_document(did, doc)?;
                    modified = true;
                }
                ReplaceDocumentTerm { term, doc } => {
                    let doc = self.replay_document(doc)?;
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .replace_document_by_term(&term, doc)?;
                    modified = true;
                }
                SetMetadata { key, value } => {
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .set_metadata(&key, &value)?;
                    modified = true;
                }
                AddSpelling { word, freq } => {
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .add_spelling(&word, freq)?;
                    modified = true;
                }
                RemoveSpelling { word, freq } => {
                    let mut guard = self.db.lock();
                    guard
                        .as_mut()
                        .ok_or(Error::DatabaseClosed)?
                        .remove_spelling(&word, freq)?;
                    modified = true;
                }
            }
        }
        Ok(modified)
    }

    /// Replayed documents may still carry their blob bytes inline; push
    /// them to storage like the original write did.
    fn replay_document(&self, doc_bytes: Vec<u8>) -> Result<Document> {
        let mut doc = Document::unserialise(&doc_bytes)?;
        let data = doc.get_data().to_vec();
        if !data.is_empty() {
            let (stripped, _) = self.storage_push_blobs(data)?;
            if !stripped.is_empty() {
                doc.set_data(stripped);
            }
        }
        Ok(doc)
    }

    fn wal_revision(&self) -> u64 {
        self.endpoint.local_revision.load(Ordering::Acquire) + 1
    }

    fn wal_write(&self, write: impl FnOnce(&mut DatabaseWal) -> Result<()>) -> Result<()> {
        let mut wal_guard = self.wal.lock();
        if let Some(wal) = wal_guard.as_mut() {
            write(wal)?;
            if !wal.is_synchronous() {
                if let (Some(ctx), Some(path)) = (self.context(), wal.current_volume_path()) {
                    ctx.fsync.debounce(path, FsyncMode::Data);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit

    /// Flushes pending storage and the backend, verifying the revision
    /// advanced by exactly one for local shards. Returns false when there
    /// was nothing to commit.
    pub fn commit(&self, wal: bool, send_update: bool) -> Result<bool> {
        debug_assert!(self.is_writable());

        if !self.is_modified() {
            tracing::debug!(endpoint = %self.endpoint.endpoint, "commit discarded, no changes");
            return Ok(false);
        }

        let committed = self.with_index_retry_opts(false, |index| {
            let local = self.is_local();

            self.storage_commit()?;

            let transaction = self.transaction();
            let snapshot = match transaction {
                Transaction::Flushed | Transaction::Unflushed => {
                    index.commit_transaction()?;
                    let snapshot = index.commit()?;
                    index.begin_transaction()?;
                    snapshot
                }
                Transaction::None => index.commit()?,
            };
            self.modified.store(false, Ordering::Release);

            if local {
                let prior = self.endpoint.local_revision.load(Ordering::Acquire);
                let current = index.revision();
                if prior == current {
                    tracing::debug!(
                        endpoint = %self.endpoint.endpoint,
                        "commit discarded, revision unchanged"
                    );
                    return Ok(false);
                }
                debug_assert_eq!(current, prior + 1);
                tracing::debug!(
                    endpoint = %self.endpoint.endpoint,
                    prior, current, "shard committed"
                );
                self.endpoint
                    .local_revision
                    .store(current, Ordering::Release);
            }

            if let (Some(ctx), Some(path)) = (self.context(), snapshot) {
                ctx.fsync.debounce(path, FsyncMode::Full);
            }
            Ok(true)
        })?;

        if committed {
            if wal && self.is_wal_active() {
                let revision = self.endpoint.local_revision.load(Ordering::Acquire);
                self.wal_write(|w| w.write_commit(revision))?;
            }
            let flags = self.flags();
            let suppressed =
                flags.contains(OpenFlags::REPLICA) || flags.contains(OpenFlags::RESTORE);
            if send_update && !suppressed {
                if let Some(ctx) = self.context() {
                    ctx.events.database_updated(&self.endpoint.endpoint);
                }
            }
        }
        Ok(committed)
    }

    // ------------------------------------------------------------------
    // Transactions

    pub fn begin_transaction(&self, flushed: bool) -> Result<()> {
        debug_assert!(self.is_writable());
        let mut transaction = self.transaction.lock();
        if *transaction == Transaction::None {
            self.ensure_open()?;
            let mut guard = self.db.lock();
            guard
                .as_mut()
                .ok_or(Error::DatabaseClosed)?
                .begin_transaction()?;
            *transaction = if flushed {
                Transaction::Flushed
            } else {
                Transaction::Unflushed
            };
        }
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        debug_assert!(self.is_writable());
        let mut transaction = self.transaction.lock();
        if *transaction != Transaction::None {
            let mut guard = self.db.lock();
            guard
                .as_mut()
                .ok_or(Error::DatabaseClosed)?
                .commit_transaction()?;
            *transaction = Transaction::None;
        }
        Ok(())
    }

    pub fn cancel_transaction(&self) -> Result<()> {
        debug_assert!(self.is_writable());
        let mut transaction = self.transaction.lock();
        if *transaction != Transaction::None {
            let mut guard = self.db.lock();
            guard
                .as_mut()
                .ok_or(Error::DatabaseClosed)?
                .cancel_transaction()?;
            *transaction = Transaction::None;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Versions

    fn version_prefix(shard_did: DocId) -> Vec<u8> {
        let mut prefix = b"V".to_vec();
        prefix.extend_from_slice(&serialise_length(u64::from(shard_did)));
        prefix
    }

    /// Serialised version currently stored for the document, if any.
    fn stored_version(index: &Index, ver_prefix: &[u8]) -> Option<Vec<u8>> {
        for term in index.allterms(ver_prefix) {
            let suffix = &term[ver_prefix.len()..];
            if !suffix.is_empty() {
                return Some(suffix.to_vec());
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Document operations

    pub fn delete_document(
        &self,
        shard_did: DocId,
        commit: bool,
        wal: bool,
        version: Option<u64>,
    ) -> Result<()> {
        debug_assert!(self.is_writable());
        let expected = version.map(|v| sortable_serialise(v as f64));

        self.with_index_retry(|index| {
            let local = self.is_local();
            if local {
                if let Some(expected) = &expected {
                    let ver_prefix = Shard::version_prefix(shard_did);
                    if let Some(current) = Shard::stored_version(index, &ver_prefix) {
                        if *expected != current {
                            return Err(Error::VersionConflict(format!(
                                "document {shard_did} version mismatch"
                            )));
                        }
                    }
                }
            }
            index.delete_document(shard_did)?;
            self.modified.store(commit || local, Ordering::Release);
            Ok(())
        })?;

        if wal && self.is_wal_active() {
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_delete_document(revision, shard_did))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(())
    }

    pub fn delete_document_term(
        &self,
        term: &[u8],
        commit: bool,
        wal: bool,
        version: Option<u64>,
    ) -> Result<()> {
        debug_assert!(self.is_writable());
        let expected = version.map(|v| sortable_serialise(v as f64));

        let deleted_did = self.with_index_retry(|index| {
            let local = self.is_local();
            let mut shard_did = 0;
            if local {
                match index.postlist_first(term) {
                    Some(did) => {
                        shard_did = did;
                        if let Some(expected) = &expected {
                            let ver_prefix = Shard::version_prefix(did);
                            if let Some(current) = Shard::stored_version(index, &ver_prefix) {
                                if *expected != current {
                                    return Err(Error::VersionConflict(format!(
                                        "document {did} version mismatch"
                                    )));
                                }
                            }
                        }
                    }
                    None => {
                        return Err(Error::NotFound("document not found".into()));
                    }
                }
            }
            if shard_did != 0 {
                index.delete_document(shard_did)?;
            } else {
                index.delete_document_by_term(term)?;
            }
            self.modified.store(commit || local, Ordering::Release);
            Ok(shard_did)
        })?;

        if wal && self.is_wal_active() {
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_delete_document(revision, deleted_did))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(())
    }

    pub fn add_document(&self, doc: Document, commit: bool, wal: bool) -> Result<DocId> {
        debug_assert!(self.is_writable());

        let mut doc = doc;
        let pushed = self.storage_push_blobs(doc.get_data().to_vec())?;
        if !pushed.0.is_empty() {
            doc.set_data(pushed.0.clone());
        }

        let base = doc.clone();
        let shard_did = self.with_index_retry(|index| {
            let mut doc = base.clone();
            let local = self.is_local();
            let shard_did = if local {
                let shard_did = index.get_lastdocid() + 1;
                let ver_prefix = Shard::version_prefix(shard_did);
                let ver = sortable_serialise(1.0);
                let mut term = ver_prefix;
                term.extend_from_slice(&ver);
                doc.add_term(term);
                doc.add_value(DB_SLOT_VERSION, ver);
                index.replace_document(shard_did, doc)?;
                shard_did
            } else {
                index.add_document(doc)?
            };
            self.modified.store(commit || local, Ordering::Release);
            Ok(shard_did)
        })?;

        if wal && self.is_wal_active() {
            let mut logged = base;
            if !pushed.1.is_empty() {
                logged.set_data(pushed.1.clone());
            }
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_replace_document(revision, shard_did, logged.serialise()))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(shard_did)
    }

    pub fn replace_document(
        &self,
        shard_did: DocId,
        doc: Document,
        commit: bool,
        wal: bool,
        version_check: bool,
    ) -> Result<DocId> {
        debug_assert!(self.is_writable());

        let mut doc = doc;
        let pushed = self.storage_push_blobs(doc.get_data().to_vec())?;
        if !pushed.0.is_empty() {
            doc.set_data(pushed.0.clone());
        }

        let caller_version = doc.get_value(DB_SLOT_VERSION);
        let base = doc.clone();
        self.with_index_retry(|index| {
            let mut doc = base.clone();
            let local = self.is_local();
            if local {
                let ver_prefix = Shard::version_prefix(shard_did);
                let mut version = 0u64;
                if let Some(current) = Shard::stored_version(index, &ver_prefix) {
                    if version_check && !caller_version.is_empty() && caller_version != current {
                        return Err(Error::VersionConflict(format!(
                            "document {shard_did} version mismatch"
                        )));
                    }
                    version = sortable_unserialise(&current) as u64;
                }
                let ver = sortable_serialise((version + 1) as f64);
                let mut term = ver_prefix;
                term.extend_from_slice(&ver);
                doc.add_term(term);
                doc.add_value(DB_SLOT_VERSION, ver);
            }
            index.replace_document(shard_did, doc)?;
            self.modified.store(commit || local, Ordering::Release);
            Ok(())
        })?;

        if wal && self.is_wal_active() {
            let mut logged = base;
            if !pushed.1.is_empty() {
                logged.set_data(pushed.1.clone());
            }
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_replace_document(revision, shard_did, logged.serialise()))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(shard_did)
    }

    pub fn replace_document_term(
        &self,
        term: &[u8],
        doc: Document,
        commit: bool,
        wal: bool,
        version_check: bool,
    ) -> Result<DocId> {
        debug_assert!(self.is_writable());

        let mut doc = doc;
        let pushed = self.storage_push_blobs(doc.get_data().to_vec())?;
        if !pushed.0.is_empty() {
            doc.set_data(pushed.0.clone());
        }

        let caller_version = doc.get_value(DB_SLOT_VERSION);
        let shards_hint = doc.get_value(DB_SLOT_SHARDS);
        let base = doc.clone();
        let result_did = self.with_index_retry(|index| {
            let mut doc = base.clone();
            let local = self.is_local();
            let mut shard_did = 0;
            if local {
                let mut version = 0u64;
                let ver_prefix;
                if term.starts_with(b"QN") {
                    let (shard_num, n_shards) = unserialise_shards_hint(&shards_hint);
                    let did = sortable_unserialise(&term[2..]) as u64;
                    if did == 0 {
                        shard_did = index.get_lastdocid() + 1;
                        let did = (u64::from(shard_did) - 1) * n_shards + shard_num + 1;
                        ver_prefix = Shard::version_prefix(shard_did);
                        let did_serialised = sortable_serialise(did as f64);
                        let mut new_term = b"QN".to_vec();
                        new_term.extend_from_slice(&did_serialised);
                        doc.add_boolean_term(new_term);
                        doc.add_value(DB_SLOT_ID, did_serialised);
                        rewrite_data_id(&mut doc, did)?;
                    } else {
                        shard_did = ((did - 1) / n_shards + 1) as DocId;
                        ver_prefix = Shard::version_prefix(shard_did);
                        if let Some(current) = Shard::stored_version(index, &ver_prefix) {
                            if version_check
                                && !caller_version.is_empty()
                                && caller_version != current
                            {
                                return Err(Error::VersionConflict(format!(
                                    "document {shard_did} version mismatch"
                                )));
                            }
                            version = sortable_unserialise(&current) as u64;
                        }
                    }
                } else {
                    match index.postlist_first(term) {
                        Some(did) => {
                            shard_did = did;
                            ver_prefix = Shard::version_prefix(did);
                            if let Some(current) = Shard::stored_version(index, &ver_prefix) {
                                if version_check
                                    && !caller_version.is_empty()
                                    && caller_version != current
                                {
                                    return Err(Error::VersionConflict(format!(
                                        "document {did} version mismatch"
                                    )));
                                }
                                version = sortable_unserialise(&current) as u64;
                            }
                        }
                        None => {
                            shard_did = index.get_lastdocid() + 1;
                            ver_prefix = Shard::version_prefix(shard_did);
                        }
                    }
                }
                let ver = sortable_serialise((version + 1) as f64);
                let mut version_term = ver_prefix;
                version_term.extend_from_slice(&ver);
                doc.add_term(version_term);
                doc.add_value(DB_SLOT_VERSION, ver);
                doc.add_value(DB_SLOT_SHARDS, Vec::new());
            }
            let did = if shard_did != 0 {
                index.replace_document(shard_did, doc)?;
                shard_did
            } else {
                index.replace_document_by_term(term, doc)?
            };
            self.modified.store(commit || local, Ordering::Release);
            Ok(did)
        })?;

        if wal && self.is_wal_active() {
            let mut logged = base;
            if !pushed.1.is_empty() {
                logged.set_data(pushed.1.clone());
            }
            let revision = self.wal_revision();
            self.wal_write(|w| {
                w.write_replace_document_term(revision, term.to_vec(), logged.serialise())
            })?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(result_did)
    }

    // ------------------------------------------------------------------
    // Blob storage

    /// Walks the document's data object promoting every stored-type blob
    /// to the current writable volume, rolling to the next volume when
    /// one fills up. Returns (data with locators, data with blobs): the
    /// former is what gets indexed, the latter what the WAL keeps.
    pub fn storage_push_blobs(&self, doc_data: Vec<u8>) -> Result<(Vec<u8>, Vec<u8>)> {
        debug_assert!(self.is_writable());
        if doc_data.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut storage_guard = self.writable_storage.lock();
        let storage = match storage_guard.as_mut() {
            Some(storage) => storage,
            None => return Ok((Vec::new(), Vec::new())),
        };

        let mut data = Data::from_serialised(&doc_data)?;
        let mut updates: Vec<Locator> = Vec::new();
        let mut erases: Vec<String> = Vec::new();
        for locator in data.iter() {
            if locator.size == 0 && !locator.ct_type.is_empty() {
                erases.push(locator.ct_type.clone());
                continue;
            }
            if locator.ty.is_stored() && !locator.raw().is_empty() {
                let payload =
                    serialise_strings([locator.ct_type.as_bytes(), locator.raw()]);
                let offset = loop {
                    if storage.is_closed() {
                        let (_, last) = BlobStorage::get_volumes_range(
                            &self.endpoint.endpoint.path,
                            crate::storage::DATA_STORAGE_PATH,
                        )?;
                        storage.open(last)?;
                    }
                    match storage.write(&payload) {
                        Ok(offset) => break offset,
                        Err(Error::StorageEof) => {
                            let next = storage.volume + 1;
                            storage.open(next)?;
                        }
                        Err(e) => return Err(e),
                    }
                };
                let mut stored =
                    Locator::stored(locator.ct_type.clone(), storage.volume, offset, locator.size);
                stored.ty = locator.ty;
                stored.volume = Some(storage.volume);
                updates.push(stored);
            }
        }

        for ct_type in erases {
            data.erase(&ct_type);
        }
        let with_blobs = data.serialise();
        for locator in updates {
            data.update(locator);
        }
        data.flush();
        let with_locators = data.serialise();
        Ok((with_locators, with_blobs))
    }

    /// Reads a stored blob record back, byte-exact.
    pub fn storage_get_stored(&self, locator: &Locator) -> Result<Vec<u8>> {
        debug_assert!(locator.ty.is_stored());
        let volume = locator
            .volume
            .ok_or_else(|| Error::InvalidArgument("locator has no volume".into()))?;

        let mut storage_guard = self.storage.lock();
        if let Some(storage) = storage_guard.as_mut() {
            storage.open(volume)?;
            storage.seek(locator.offset)?;
            return storage.read();
        }
        drop(storage_guard);

        // No local storage: remote shards keep blobs under a metadata key.
        let mut key = vec![0u8];
        key.extend_from_slice(&serialise_length(u64::from(volume)));
        key.extend_from_slice(&serialise_length(u64::from(locator.offset)));
        self.get_metadata(&key)
    }

    fn storage_commit(&self) -> Result<()> {
        let mut storage_guard = self.writable_storage.lock();
        if let Some(storage) = storage_guard.as_mut() {
            if let Some(path) = storage.commit()? {
                if let Some(ctx) = self.context() {
                    ctx.fsync.debounce(path, FsyncMode::Full);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads and metadata

    pub fn get_document(&self, shard_did: DocId) -> Result<Document> {
        self.with_index_retry(|index| index.get_document(shard_did))
    }

    pub fn get_lastdocid(&self) -> Result<DocId> {
        self.with_index_retry(|index| Ok(index.get_lastdocid()))
    }

    pub fn get_docid_term(&self, term: &[u8]) -> Result<DocId> {
        self.with_index_retry(|index| {
            index
                .postlist_first(term)
                .ok_or_else(|| Error::NotFound("document not found".into()))
        })
    }

    pub fn get_metadata(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.with_index_retry(|index| Ok(index.get_metadata(key)))
    }

    pub fn get_metadata_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_index_retry(|index| Ok(index.metadata_keys()))
    }

    pub fn set_metadata(&self, key: &[u8], value: &[u8], commit: bool, wal: bool) -> Result<()> {
        debug_assert!(self.is_writable());
        self.with_index_retry(|index| {
            let local = self.is_local();
            index.set_metadata(key, value)?;
            self.modified.store(commit || local, Ordering::Release);
            Ok(())
        })?;

        if wal && self.is_wal_active() {
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_set_metadata(revision, key.to_vec(), value.to_vec()))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(())
    }

    pub fn add_spelling(&self, word: &[u8], freqinc: u32, commit: bool, wal: bool) -> Result<()> {
        debug_assert!(self.is_writable());
        self.with_index_retry(|index| {
            let local = self.is_local();
            index.add_spelling(word, freqinc)?;
            self.modified.store(commit || local, Ordering::Release);
            Ok(())
        })?;

        if wal && self.is_wal_active() {
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_add_spelling(revision, word.to_vec(), freqinc))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(())
    }

    pub fn remove_spelling(
        &self,
        word: &[u8],
        freqdec: u32,
        commit: bool,
        wal: bool,
    ) -> Result<u32> {
        debug_assert!(self.is_writable());
        let remaining = self.with_index_retry(|index| {
            let local = self.is_local();
            let remaining = index.remove_spelling(word, freqdec)?;
            self.modified.store(commit || local, Ordering::Release);
            Ok(remaining)
        })?;

        if wal && self.is_wal_active() {
            let revision = self.wal_revision();
            self.wal_write(|w| w.write_remove_spelling(revision, word.to_vec(), freqdec))?;
        }
        if commit {
            self.commit(wal, true)?;
        }
        Ok(remaining)
    }

    pub fn search(
        &self,
        query: &Query,
        sort: Option<&KeyMaker>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Match>> {
        self.with_index_retry(|index| index.search(query, sort, offset, limit))
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.do_close_inner(true, true);
    }
}

/// (shard number, shard count) from the shards-hint slot; defaults keep a
/// single-shard interpretation.
fn unserialise_shards_hint(hint: &[u8]) -> (u64, u64) {
    if hint.is_empty() {
        return (0, 1);
    }
    match unserialise_length(hint) {
        Ok((shard_num, n)) => match unserialise_length(&hint[n..]) {
            Ok((n_shards, _)) if n_shards > 0 => (shard_num, n_shards),
            _ => (shard_num, 1),
        },
        Err(_) => (0, 1),
    }
}

pub fn serialise_shards_hint(shard_num: u64, n_shards: u64) -> Vec<u8> {
    let mut out = serialise_length(shard_num);
    out.extend_from_slice(&serialise_length(n_shards));
    out
}

/// Stamps the freshly assigned global id into the serialized data object
/// when the caller left a numeric `_id` placeholder.
fn rewrite_data_id(doc: &mut Document, did: u64) -> Result<()> {
    let raw = doc.get_data().to_vec();
    if raw.is_empty() {
        return Ok(());
    }
    let mut data = Data::from_serialised(&raw)?;
    let mut obj = data.get_obj()?;
    if let Some(value) = obj.get_mut(ID_FIELD_NAME) {
        if value.is_number() {
            *value = serde_json::Value::from(did);
            data.set_obj(&obj)?;
            data.flush();
            doc.set_data(data.serialise());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
