use tempfile::TempDir;
use uuid::Uuid;

use super::*;
use crate::serialise::{serialise_strings, unserialise_string_at};

const CAP: u64 = 64 * 1024;

#[test]
fn write_then_read_back_byte_exact() {
    let dir = TempDir::new().unwrap();
    let uuid = Uuid::new_v4();
    let mut storage = BlobStorage::new(dir.path(), uuid, true, CAP);
    storage.open(0).unwrap();

    let payload = serialise_strings([b"image/png".as_slice(), b"\x89PNG blob bytes"]);
    let offset = storage.write(&payload).unwrap();
    let second = storage.write(b"second record").unwrap();
    assert!(second > offset);

    storage.seek(offset).unwrap();
    assert_eq!(storage.read().unwrap(), payload);
    assert_eq!(
        unserialise_string_at(STORED_CONTENT_TYPE, &payload).unwrap(),
        b"image/png".to_vec()
    );

    storage.seek(second).unwrap();
    assert_eq!(storage.read().unwrap(), b"second record".to_vec());
}

#[test]
fn reopen_validates_uuid() {
    let dir = TempDir::new().unwrap();
    let uuid = Uuid::new_v4();
    let mut storage = BlobStorage::new(dir.path(), uuid, true, CAP);
    storage.open(0).unwrap();
    storage.write(b"data").unwrap();
    storage.close();

    let mut reader = BlobStorage::new(dir.path(), uuid, false, CAP);
    reader.open(0).unwrap();

    let mut wrong = BlobStorage::new(dir.path(), Uuid::new_v4(), false, CAP);
    assert!(matches!(wrong.open(0), Err(Error::CorruptVolume(_))));
}

#[test]
fn corrupted_record_is_detected() {
    let dir = TempDir::new().unwrap();
    let uuid = Uuid::new_v4();
    let mut storage = BlobStorage::new(dir.path(), uuid, true, CAP);
    storage.open(0).unwrap();
    let offset = storage.write(b"precious bytes").unwrap();
    storage.close();

    let path = dir.path().join("docdata.0");
    let mut bytes = std::fs::read(&path).unwrap();
    let flip = offset as usize + 8;
    bytes[flip] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let mut reader = BlobStorage::new(dir.path(), uuid, false, CAP);
    reader.open(0).unwrap();
    reader.seek(offset).unwrap();
    assert!(matches!(reader.read(), Err(Error::CorruptVolume(_))));
}

#[test]
fn full_volume_reports_eof() {
    let dir = TempDir::new().unwrap();
    let uuid = Uuid::new_v4();
    let mut storage = BlobStorage::new(dir.path(), uuid, true, 4096 + 64);
    storage.open(0).unwrap();

    storage.write(&[0u8; 16]).unwrap();
    assert!(matches!(storage.write(&[0u8; 64]), Err(Error::StorageEof)));

    // Rolling to the next volume makes room again.
    storage.volume += 1;
    let next = storage.volume;
    storage.open(next).unwrap();
    storage.write(&[0u8; 64]).unwrap_err(); // still over this tiny cap
    storage.write(&[0u8; 16]).unwrap();

    let (first, last) = BlobStorage::get_volumes_range(dir.path(), DATA_STORAGE_PATH).unwrap();
    assert_eq!((first, last), (0, 1));
}

#[test]
fn locator_serialisation_round_trip() {
    let inline = Locator::inplace("text/plain", b"short".to_vec());
    let decoded = Locator::unserialise(&inline.serialise()).unwrap();
    assert_eq!(decoded.ct_type, "text/plain");
    assert_eq!(decoded.data().unwrap(), b"short".to_vec());

    let compressed = Locator::compressed_inplace("text/plain", b"not very random bytes");
    let decoded = Locator::unserialise(&compressed.serialise()).unwrap();
    assert_eq!(decoded.data().unwrap(), b"not very random bytes".to_vec());
    assert_eq!(decoded.size, 21);

    let stored = Locator::stored("image/png", 3, 8192, 1024);
    let decoded = Locator::unserialise(&stored.serialise()).unwrap();
    assert_eq!(decoded.volume, Some(3));
    assert_eq!(decoded.offset, 8192);
    assert_eq!(decoded.size, 1024);

    // A stored locator still carrying its bytes keeps them inline.
    let pending = Locator::stored_pending("image/png", b"blob".to_vec());
    let decoded = Locator::unserialise(&pending.serialise()).unwrap();
    assert!(decoded.ty.is_stored());
    assert_eq!(decoded.volume, None);
    assert_eq!(decoded.raw(), b"blob");
}

#[test]
fn data_object_round_trip() {
    let obj = serde_json::json!({"msg": "hi", "n": 3});
    let mut data = Data::from_obj(&obj).unwrap();
    data.update(Locator::stored_pending("image/png", b"png bytes".to_vec()));
    data.flush();

    let serialised = data.serialise();
    let decoded = Data::from_serialised(&serialised).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded.get_obj().unwrap(), obj);
    assert_eq!(decoded.get("image/png").unwrap().raw(), b"png bytes");

    let mut decoded = decoded;
    decoded.erase("image/png");
    decoded.flush();
    assert_eq!(decoded.len(), 1);
    assert!(decoded.get("image/png").is_none());
}

#[test]
fn empty_data_serialises_to_sentinel() {
    let data = Data::new();
    assert_eq!(data.serialise(), vec![0x11, 0x00, 0x15]);
    assert!(Data::from_serialised(&[]).unwrap().is_empty());
}
