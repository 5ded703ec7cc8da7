//! Locators and the per-document data object.
//!
//! A document's serialized data is a list of locators keyed by content
//! type: small blobs inline (optionally lz4-compressed), large ones point
//! into blob storage by (volume, offset, size). The locator for the empty
//! content type holds the document's JSON object.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::errors::{Error, Result};
use crate::serialise::{serialise_length, unserialise_length};

const DATA_HEADER_MAGIC: u8 = 0x11;
const DATA_FOOTER_MAGIC: u8 = 0x15;

/// Indices into a stored record's string list.
pub const STORED_CONTENT_TYPE: usize = 0;
pub const STORED_BLOB: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorType {
    Inplace,
    Stored,
    CompressedInplace,
    CompressedStored,
}

impl LocatorType {
    fn from_u8(value: u8) -> Result<LocatorType> {
        Ok(match value {
            0 => LocatorType::Inplace,
            1 => LocatorType::Stored,
            2 => LocatorType::CompressedInplace,
            3 => LocatorType::CompressedStored,
            other => {
                return Err(Error::Serialisation(format!("bad locator type {other}")));
            }
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            LocatorType::Inplace => 0,
            LocatorType::Stored => 1,
            LocatorType::CompressedInplace => 2,
            LocatorType::CompressedStored => 3,
        }
    }

    pub fn is_stored(self) -> bool {
        matches!(self, LocatorType::Stored | LocatorType::CompressedStored)
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            LocatorType::CompressedInplace | LocatorType::CompressedStored
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
    pub ty: LocatorType,
    pub ct_type: String,
    pub volume: Option<u32>,
    pub offset: u32,
    pub size: u32,
    raw: Vec<u8>,
}

impl Locator {
    pub fn inplace(ct_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Locator {
        let data = data.into();
        Locator {
            ty: LocatorType::Inplace,
            ct_type: ct_type.into(),
            volume: None,
            offset: 0,
            size: data.len() as u32,
            raw: data,
        }
    }

    pub fn compressed_inplace(ct_type: impl Into<String>, data: &[u8]) -> Locator {
        Locator {
            ty: LocatorType::CompressedInplace,
            ct_type: ct_type.into(),
            volume: None,
            offset: 0,
            size: data.len() as u32,
            raw: compress_prepend_size(data),
        }
    }

    /// A blob destined for blob storage; `raw` holds the bytes until the
    /// shard pushes them to a volume.
    pub fn stored_pending(ct_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Locator {
        let data = data.into();
        Locator {
            ty: LocatorType::Stored,
            ct_type: ct_type.into(),
            volume: None,
            offset: 0,
            size: data.len() as u32,
            raw: data,
        }
    }

    pub fn stored(ct_type: impl Into<String>, volume: u32, offset: u32, size: u32) -> Locator {
        Locator {
            ty: LocatorType::Stored,
            ct_type: ct_type.into(),
            volume: Some(volume),
            offset,
            size,
            raw: Vec::new(),
        }
    }

    /// Inline payload as handed in (compressed form for compressed types).
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Decoded inline payload.
    pub fn data(&self) -> Result<Vec<u8>> {
        if self.ty.is_compressed() && !self.raw.is_empty() {
            decompress_size_prepended(&self.raw)
                .map_err(|e| Error::Serialisation(format!("blob decompression failed: {e}")))
        } else {
            Ok(self.raw.clone())
        }
    }

    pub fn serialise(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.ct_type.len() + self.raw.len());
        out.push(self.ty.as_u8());
        out.extend_from_slice(&serialise_length(self.ct_type.len() as u64));
        out.extend_from_slice(self.ct_type.as_bytes());
        match self.volume {
            Some(volume) if self.ty.is_stored() => {
                out.push(0);
                out.extend_from_slice(&serialise_length(u64::from(volume)));
                out.extend_from_slice(&serialise_length(u64::from(self.offset)));
                out.extend_from_slice(&serialise_length(u64::from(self.size)));
            }
            _ => {
                out.push(1);
                out.extend_from_slice(&self.raw);
            }
        }
        out
    }

    pub fn unserialise(bytes: &[u8]) -> Result<Locator> {
        if bytes.len() < 3 {
            return Err(Error::Serialisation("truncated locator".into()));
        }
        let ty = LocatorType::from_u8(bytes[0])?;
        let mut cursor = &bytes[1..];
        let (ct_len, n) = unserialise_length(cursor)?;
        cursor = &cursor[n..];
        let ct_len = ct_len as usize;
        if cursor.len() < ct_len + 1 {
            return Err(Error::Serialisation("truncated locator".into()));
        }
        let ct_type = String::from_utf8_lossy(&cursor[..ct_len]).into_owned();
        cursor = &cursor[ct_len..];
        let inline = cursor[0] == 1;
        cursor = &cursor[1..];

        if inline {
            let raw = cursor.to_vec();
            let size = if ty.is_compressed() {
                match decompress_size_prepended(&raw) {
                    Ok(data) => data.len() as u32,
                    Err(_) => raw.len() as u32,
                }
            } else {
                raw.len() as u32
            };
            Ok(Locator { ty, ct_type, volume: None, offset: 0, size, raw })
        } else {
            let (volume, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            let (offset, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            let (size, _) = unserialise_length(cursor)?;
            Ok(Locator {
                ty,
                ct_type,
                volume: Some(volume as u32),
                offset: offset as u32,
                size: size as u32,
                raw: Vec::new(),
            })
        }
    }
}

enum PendingOp {
    Update(Locator),
    Erase(String),
}

/// A document's serialized data object: locators plus pending edits that
/// take effect on `flush`.
#[derive(Default)]
pub struct Data {
    locators: Vec<Locator>,
    pending: Vec<PendingOp>,
}

impl Data {
    pub fn new() -> Data {
        Data::default()
    }

    pub fn from_obj(obj: &serde_json::Value) -> Result<Data> {
        let mut data = Data::new();
        data.set_obj(obj)?;
        data.flush();
        Ok(data)
    }

    pub fn from_serialised(bytes: &[u8]) -> Result<Data> {
        if bytes.is_empty() {
            return Ok(Data::new());
        }
        if bytes.first() != Some(&DATA_HEADER_MAGIC) {
            return Err(Error::Serialisation("bad data header magic".into()));
        }
        let mut cursor = &bytes[1..];
        let mut locators = Vec::new();
        loop {
            let (len, n) = unserialise_length(cursor)?;
            cursor = &cursor[n..];
            if len == 0 {
                break;
            }
            let len = len as usize;
            if cursor.len() < len {
                return Err(Error::Serialisation("truncated data object".into()));
            }
            locators.push(Locator::unserialise(&cursor[..len])?);
            cursor = &cursor[len..];
        }
        if cursor.first() != Some(&DATA_FOOTER_MAGIC) {
            return Err(Error::Serialisation("bad data footer magic".into()));
        }
        Ok(Data { locators, pending: Vec::new() })
    }

    pub fn serialise(&self) -> Vec<u8> {
        let mut out = vec![DATA_HEADER_MAGIC];
        for locator in &self.locators {
            let bytes = locator.serialise();
            out.extend_from_slice(&serialise_length(bytes.len() as u64));
            out.extend_from_slice(&bytes);
        }
        out.extend_from_slice(&serialise_length(0));
        out.push(DATA_FOOTER_MAGIC);
        out
    }

    pub fn update(&mut self, locator: Locator) {
        self.pending.push(PendingOp::Update(locator));
    }

    pub fn erase(&mut self, ct_type: &str) {
        self.pending.push(PendingOp::Erase(ct_type.to_string()));
    }

    /// Applies pending edits in order.
    pub fn flush(&mut self) {
        for op in self.pending.drain(..) {
            match op {
                PendingOp::Update(locator) => {
                    match self
                        .locators
                        .iter_mut()
                        .find(|l| l.ct_type == locator.ct_type)
                    {
                        Some(existing) => *existing = locator,
                        None => self.locators.push(locator),
                    }
                }
                PendingOp::Erase(ct_type) => {
                    self.locators.retain(|l| l.ct_type != ct_type);
                }
            }
        }
    }

    pub fn get(&self, ct_type: &str) -> Option<&Locator> {
        self.locators.iter().find(|l| l.ct_type == ct_type)
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Locator> {
        self.locators.iter()
    }

    /// The document's JSON object, held by the empty content type locator.
    pub fn get_obj(&self) -> Result<serde_json::Value> {
        match self.get("") {
            Some(locator) => {
                let bytes = locator.data()?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Serialisation(format!("bad data object: {e}")))
            }
            None => Ok(serde_json::Value::Null),
        }
    }

    pub fn set_obj(&mut self, obj: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(obj)
            .map_err(|e| Error::Serialisation(format!("bad data object: {e}")))?;
        self.update(Locator::inplace("", bytes));
        Ok(())
    }
}
