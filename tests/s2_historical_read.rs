//! A historical view of an earlier version coexists with the current one.

use crab_store::StoreBuilder;
use tempfile::NamedTempFile;

#[test]
fn open_map_version_sees_its_own_commit_not_the_latest() {
    let tmp = NamedTempFile::new().unwrap();
    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    let x = store.open_map("x").unwrap();

    store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
    store.store().unwrap();
    store.put(x, b"a".to_vec().into(), b"2".to_vec().into()).unwrap();
    store.store().unwrap();
    store.put(x, b"a".to_vec().into(), b"3".to_vec().into()).unwrap();
    store.store().unwrap();

    let mut historical = store.open_map_version(x, 2).unwrap();
    assert_eq!(historical.get(b"a", &mut store).unwrap().as_deref(), Some(&b"2"[..]));
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"3"[..]));
}

#[test]
fn unknown_version_is_rejected() {
    let tmp = NamedTempFile::new().unwrap();
    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    let x = store.open_map("x").unwrap();
    store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
    store.store().unwrap();

    assert!(store.open_map_version(x, 99).is_err());
}
