//! Multi-value sort keys.

use crate::backend::Document;
use crate::serialise::sortable_serialise;

#[derive(Debug, Clone)]
pub enum Metric {
    /// Levenshtein distance between the slot value and a reference string.
    Levenshtein { reference: String },
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub slot: u32,
    pub descending: bool,
    pub metric: Option<Metric>,
}

/// Builds a composite byte key per document; keys compare ascending.
#[derive(Debug, Clone, Default)]
pub struct KeyMaker {
    keys: Vec<SortKey>,
}

impl KeyMaker {
    pub fn new(keys: Vec<SortKey>) -> KeyMaker {
        KeyMaker { keys }
    }

    pub fn push(&mut self, key: SortKey) {
        self.keys.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, doc: &Document) -> Vec<u8> {
        let mut out = Vec::new();
        for key in &self.keys {
            let raw = doc.get_value(key.slot);
            let mut part = match &key.metric {
                Some(Metric::Levenshtein { reference }) => {
                    let value = String::from_utf8_lossy(&raw);
                    sortable_serialise(levenshtein(&value, reference) as f64)
                }
                None => raw,
            };
            if key.descending {
                for byte in &mut part {
                    *byte = !*byte;
                }
            }
            // Length-terminated framing keeps composite keys comparable.
            out.extend_from_slice(&part);
            out.push(if key.descending { 0xff } else { 0x00 });
        }
        out
    }
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
