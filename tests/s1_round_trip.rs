//! Commit once, reopen, and read back the same value.

use crab_store::StoreBuilder;
use tempfile::NamedTempFile;

#[test]
fn commit_then_reopen_round_trips() {
    let tmp = NamedTempFile::new().unwrap();

    {
        let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
        let x = store.open_map("x").unwrap();
        store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
        let version = store.store().unwrap();
        assert_eq!(version, 1);
        assert_eq!(store.chunk_count(), 1);
    }

    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    let x = store.open_map("x").unwrap();
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(store.current_version(), 1);
    assert_eq!(store.chunk_count(), 1);
}
