//! Corrupting one header copy is survived via the other copy or the
//! trailing header of the newest chunk.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use crab_store::StoreBuilder;
use tempfile::NamedTempFile;

#[test]
fn corrupting_block_zero_still_recovers_via_block_one() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
        let x = store.open_map("x").unwrap();
        store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
        store.store().unwrap();
    }

    let mut file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.seek(SeekFrom::Start(20)).unwrap();
    file.write_all(&[0xFFu8; 8]).unwrap();
    drop(file);

    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    assert_eq!(store.current_version(), 1);
    let x = store.open_map("x").unwrap();
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"1"[..]));
}

#[test]
fn corrupting_both_leading_copies_still_recovers_via_trailing_header() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
        let x = store.open_map("x").unwrap();
        store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
        store.store().unwrap();
    }

    let mut file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.seek(SeekFrom::Start(10)).unwrap();
    file.write_all(&[0xFFu8; 8]).unwrap();
    file.seek(SeekFrom::Start(4096 + 10)).unwrap();
    file.write_all(&[0xFFu8; 8]).unwrap();
    drop(file);

    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    assert_eq!(store.current_version(), 1);
    let x = store.open_map("x").unwrap();
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"1"[..]));
}
