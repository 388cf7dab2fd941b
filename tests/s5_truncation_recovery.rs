//! A file truncated at a chunk boundary (or mid-chunk, after the previous
//! chunk's trailing header) still opens to a consistent, slightly-older
//! state.

use std::fs::OpenOptions;

use crab_store::StoreBuilder;
use tempfile::NamedTempFile;

#[test]
fn truncating_at_chunk_end_keeps_that_commit() {
    let tmp = NamedTempFile::new().unwrap();
    {
        let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
        let x = store.open_map("x").unwrap();
        store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
        store.store().unwrap();
    }
    let chunk0_end = std::fs::metadata(tmp.path()).unwrap().len();

    let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.set_len(chunk0_end).unwrap();
    drop(file);

    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    assert_eq!(store.current_version(), 1);
    let x = store.open_map("x").unwrap();
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"1"[..]));
}

#[test]
fn truncating_mid_chunk_falls_back_to_the_previous_commit() {
    let tmp = NamedTempFile::new().unwrap();
    let chunk0_end;
    {
        let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
        let x = store.open_map("x").unwrap();
        store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
        store.store().unwrap();
        chunk0_end = std::fs::metadata(tmp.path()).unwrap().len();

        store.put(x, b"a".to_vec().into(), b"2".to_vec().into()).unwrap();
        store.store().unwrap();
    }
    let full_len = std::fs::metadata(tmp.path()).unwrap().len();
    assert!(full_len > chunk0_end, "second commit must have appended bytes");

    // Truncate somewhere inside chunk 1's bytes, after chunk 0's own
    // trailing header is already on disk.
    let truncated_len = chunk0_end + (full_len - chunk0_end) / 2;
    let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.set_len(truncated_len).unwrap();
    drop(file);

    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    assert_eq!(store.current_version(), 1);
    let x = store.open_map("x").unwrap();
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"1"[..]));
}
