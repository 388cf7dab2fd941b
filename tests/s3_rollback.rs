//! Rollback to an earlier version, then keep writing.

use crab_store::StoreBuilder;
use tempfile::NamedTempFile;

#[test]
fn rollback_then_continue_produces_a_fresh_version() {
    let tmp = NamedTempFile::new().unwrap();
    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    let x = store.open_map("x").unwrap();

    store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
    store.store().unwrap();
    store.put(x, b"a".to_vec().into(), b"2".to_vec().into()).unwrap();
    store.store().unwrap();
    store.put(x, b"a".to_vec().into(), b"3".to_vec().into()).unwrap();
    store.store().unwrap();

    store.rollback_to(2).unwrap();
    assert_eq!(store.current_version(), 2);
    assert_eq!(store.get(x, b"a").unwrap().as_deref(), Some(&b"2"[..]));

    store.put(x, b"a".to_vec().into(), b"9".to_vec().into()).unwrap();
    let version = store.store().unwrap();
    assert_eq!(version, 3);
    drop(store);

    let mut reopened = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    let x = reopened.open_map("x").unwrap();
    assert_eq!(reopened.get(x, b"a").unwrap().as_deref(), Some(&b"9"[..]));
}

#[test]
fn rollback_discards_maps_created_after_the_target_version() {
    let tmp = NamedTempFile::new().unwrap();
    let mut store = StoreBuilder::new().file_name(tmp.path()).open().unwrap();
    let x = store.open_map("x").unwrap();
    store.put(x, b"a".to_vec().into(), b"1".to_vec().into()).unwrap();
    store.store().unwrap();

    store.open_map("y").unwrap();
    store.store().unwrap();
    assert!(store.map_exists("y"));

    store.rollback_to(1).unwrap();
    assert!(!store.map_exists("y"));
    assert!(store.map_exists("x"));
}
