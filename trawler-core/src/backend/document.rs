//! The unit stored by the index backend: terms, slot values and an opaque
//! serialized data blob.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::{Error, Result};
use crate::serialise::{serialise_length, unserialise_length};

pub type DocId = u32;
pub type Term = Vec<u8>;

/// Slot holding the document version (sortable serialised integer).
pub const DB_SLOT_ID: u32 = 0;
pub const DB_SLOT_VERSION: u32 = 1;
/// Slot carrying shard number and shard count for fresh multi-shard
/// inserts; cleared once the document is stored.
pub const DB_SLOT_SHARDS: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    terms: BTreeMap<Term, u32>,
    values: BTreeMap<u32, Vec<u8>>,
    data: Vec<u8>,
}

impl Document {
    pub fn new() -> Document {
        Document::default()
    }

    pub fn add_term(&mut self, term: impl Into<Term>) {
        *self.terms.entry(term.into()).or_insert(0) += 1;
    }

    /// Boolean terms carry no within-document frequency.
    pub fn add_boolean_term(&mut self, term: impl Into<Term>) {
        self.terms.entry(term.into()).or_insert(0);
    }

    pub fn remove_term(&mut self, term: &[u8]) {
        self.terms.remove(term);
    }

    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        self.terms.keys()
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn has_term(&self, term: &[u8]) -> bool {
        self.terms.contains_key(term)
    }

    /// Setting an empty value removes the slot.
    pub fn add_value(&mut self, slot: u32, value: impl Into<Vec<u8>>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&slot);
        } else {
            self.values.insert(slot, value);
        }
    }

    /// Returns the slot value, empty if unset.
    pub fn get_value(&self, slot: u32) -> Vec<u8> {
        self.values.get(&slot).cloned().unwrap_or_default()
    }

    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn serialise(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&serialise_length(self.terms.len() as u64));
        for (term, wdf) in &self.terms {
            buf.extend_from_slice(&serialise_length(term.len() as u64));
            buf.extend_from_slice(term);
            buf.extend_from_slice(&serialise_length(u64::from(*wdf)));
        }
        buf.extend_from_slice(&serialise_length(self.values.len() as u64));
        for (slot, value) in &self.values {
            buf.extend_from_slice(&serialise_length(u64::from(*slot)));
            buf.extend_from_slice(&serialise_length(value.len() as u64));
            buf.extend_from_slice(value);
        }
        buf.put_u32(self.data.len() as u32);
        buf.extend_from_slice(&self.data);
        buf.freeze().to_vec()
    }

    pub fn unserialise(bytes: &[u8]) -> Result<Document> {
        let mut doc = Document::new();
        let mut cursor = bytes;

        let (term_count, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        for _ in 0..term_count {
            let (len, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            let len = len as usize;
            if cursor.len() < len {
                return Err(Error::Serialisation("truncated document term".into()));
            }
            let term = cursor[..len].to_vec();
            cursor = &cursor[len..];
            let (wdf, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            doc.terms.insert(term, wdf as u32);
        }

        let (value_count, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        for _ in 0..value_count {
            let (slot, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            let (len, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            let len = len as usize;
            if cursor.len() < len {
                return Err(Error::Serialisation("truncated document value".into()));
            }
            doc.values.insert(slot as u32, cursor[..len].to_vec());
            cursor = &cursor[len..];
        }

        if cursor.len() < 4 {
            return Err(Error::Serialisation("truncated document data".into()));
        }
        let mut cur = cursor;
        let data_len = cur.get_u32() as usize;
        if cur.len() < data_len {
            return Err(Error::Serialisation("truncated document data".into()));
        }
        doc.data = cur[..data_len].to_vec();
        Ok(doc)
    }
}
