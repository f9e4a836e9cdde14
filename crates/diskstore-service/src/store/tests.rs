use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::test;

use super::*;

fn store_at(path: &Path) -> DiskStore {
    DiskStore::new(StoreConfig {
        path: path.to_owned(),
        ..Default::default()
    })
    .unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_root_created() {
    test::setup();
    let dir = test::tempdir();
    let root = dir.path().join("cache");

    let _store = store_at(&root);
    assert!(fs::metadata(root).unwrap().is_dir());
}

#[tokio::test]
async fn test_set_get_roundtrip() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    assert_eq!(store.get("greeting").await.unwrap(), None);
    assert!(!store.has("greeting").await.unwrap());

    store
        .set("greeting", "hello world".into(), None)
        .await
        .unwrap();

    assert_eq!(
        store.get("greeting").await.unwrap(),
        Some(Value::String("hello world".into()))
    );
    assert!(store.has("greeting").await.unwrap());
}

#[tokio::test]
async fn test_sharded_layout() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store.set("greeting", "hi".into(), None).await.unwrap();

    // sha256("greeting") starts with 18f.
    let record = dir
        .path()
        .join("diskstore-18f")
        .join("6b0200b6fd32ce4e85b6c841f72247964195b8e1cd7c52e046dc51e48f779.json");
    assert!(record.is_file());
}

#[tokio::test]
async fn test_flat_layout() {
    test::setup();
    let dir = test::tempdir();
    let store = DiskStore::new(StoreConfig {
        path: dir.path().to_owned(),
        subdirs: false,
        ..Default::default()
    })
    .unwrap();

    store.set("greeting", "hi".into(), None).await.unwrap();

    let record = dir
        .path()
        .join("diskstore-18f6b0200b6fd32ce4e85b6c841f72247964195b8e1cd7c52e046dc51e48f779.json");
    assert!(record.is_file());
}

#[tokio::test]
async fn test_binary_payload_roundtrip() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());
    let payload: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();

    let value = Value::Object(
        [
            ("name".to_owned(), "blob".into()),
            ("data".to_owned(), payload.clone().into()),
        ]
        .into(),
    );
    store.set("blob", value.clone(), None).await.unwrap();

    let base = store.entry_path("blob");
    assert!(codec::primary_path(&base, false).is_file());

    let read_back = store.get("blob").await.unwrap().unwrap();
    assert_eq!(read_back, value);
}

#[tokio::test]
async fn test_non_finite_numbers_roundtrip() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    let value = Value::Object(
        [
            ("max".to_owned(), f64::INFINITY.into()),
            ("min".to_owned(), f64::NEG_INFINITY.into()),
        ]
        .into(),
    );
    store.set("limits", value.clone(), None).await.unwrap();

    assert_eq!(store.get("limits").await.unwrap(), Some(value));
}

#[tokio::test]
async fn test_ttl_override_expires_entry() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store
        .set("short", "lived".into(), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    store.set("long", "lived".into(), None).await.unwrap();

    assert!(store.has("short").await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.get("short").await.unwrap(), None);
    assert!(store.has("long").await.unwrap());

    // The miss schedules a background cleanup of the dead record.
    let record = codec::primary_path(&store.entry_path("short"), false);
    wait_until(|| !record.exists()).await;
}

#[tokio::test]
async fn test_collision_is_a_miss_and_preserved() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store.set("greeting", "hello".into(), None).await.unwrap();

    // Forge a record claiming another key stored it, as a digest collision
    // would produce.
    let record = codec::primary_path(&store.entry_path("greeting"), false);
    let contents = fs::read_to_string(&record).unwrap();
    fs::write(&record, contents.replace("\"greeting\"", "\"impostor\"")).unwrap();

    assert_eq!(store.get("greeting").await.unwrap(), None);

    // The foreign entry is not cleaned up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(record.is_file());
}

#[tokio::test]
async fn test_delete() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store.set("greeting", "hello".into(), None).await.unwrap();

    assert!(store.delete("greeting").await.unwrap());
    assert_eq!(store.get("greeting").await.unwrap(), None);

    // Same key again: the shard directory is still there, the record is not.
    assert!(!store.delete("greeting").await.unwrap());
    // Never-written key: not even the shard directory exists.
    assert!(!store.delete("never written").await.unwrap());
}

#[tokio::test]
async fn test_delete_missing_flat_entry() {
    test::setup();
    let dir = test::tempdir();
    let store = DiskStore::new(StoreConfig {
        path: dir.path().to_owned(),
        subdirs: false,
        ..Default::default()
    })
    .unwrap();

    assert!(!store.delete("never written").await.unwrap());
}

#[tokio::test]
async fn test_delete_removes_payload_files() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store
        .set("blob", vec![1u8; 5000].into(), None)
        .await
        .unwrap();
    let base = store.entry_path("blob");
    assert!(codec::primary_path(&base, false).is_file());

    assert!(store.delete("blob").await.unwrap());

    let shard = base.parent().unwrap();
    let leftovers: Vec<_> = fs::read_dir(shard).unwrap().collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn test_clear_preserves_foreign_files() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store.set("greeting", "hello".into(), None).await.unwrap();
    store
        .set("blob", vec![9u8; 1500].into(), None)
        .await
        .unwrap();

    let shard = store.entry_path("greeting").parent().unwrap().to_owned();
    fs::write(dir.path().join("readme.txt"), "keep me").unwrap();
    fs::write(dir.path().join("other.json"), "{}").unwrap();
    fs::write(shard.join("notes.txt"), "keep me too").unwrap();

    // Matching names deeper than the walk goes are out of reach.
    let deep = dir.path().join("deep1").join("deep2");
    fs::create_dir_all(&deep).unwrap();
    fs::write(deep.join("diskstore-abc.json"), "{}").unwrap();

    let stats = store.clear().await.unwrap();

    // Two records plus one payload file.
    assert_eq!(stats.removed_files, 3);
    assert_eq!(stats.retained_files, 3);

    assert_eq!(store.get("greeting").await.unwrap(), None);
    assert_eq!(store.get("blob").await.unwrap(), None);
    assert!(dir.path().join("readme.txt").is_file());
    assert!(dir.path().join("other.json").is_file());
    assert!(shard.join("notes.txt").is_file());
    assert!(deep.join("diskstore-abc.json").is_file());
}

#[tokio::test]
async fn test_concurrent_writers_serialize() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.set("contended", "first".into(), None).await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.set("contended", "second".into(), None).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Whichever writer came second, the entry decodes to exactly one of the
    // two values.
    let value = store.get("contended").await.unwrap().unwrap();
    assert!(
        value == Value::String("first".into()) || value == Value::String("second".into()),
        "{value:?}"
    );
}

#[tokio::test]
async fn test_read_reconciles_with_writer() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store.set("greeting", "hello".into(), None).await.unwrap();

    let record = codec::primary_path(&store.entry_path("greeting"), false);
    let good = fs::read(&record).unwrap();

    // Half a record plus a held entry lock, as seen mid-write.
    fs::write(&record, &good[..good.len() / 2]).unwrap();
    let sentinel = {
        let mut os = record.clone().into_os_string();
        os.push(".lock");
        std::path::PathBuf::from(os)
    };
    fs::create_dir(&sentinel).unwrap();

    let reader = {
        let store = store.clone();
        tokio::spawn(async move { store.get("greeting").await })
    };

    // Give the reader time to fail its first read and start waiting on the
    // lock, then let the "writer" finish.
    tokio::time::sleep(Duration::from_millis(100)).await;
    fs::write(&record, &good).unwrap();
    fs::remove_dir(&sentinel).unwrap();

    let value = reader.await.unwrap().unwrap();
    assert_eq!(value, Some(Value::String("hello".into())));
}

#[tokio::test]
async fn test_corrupt_record_is_an_error() {
    test::setup();
    let dir = test::tempdir();
    let store = store_at(dir.path());

    store.set("greeting", "hello".into(), None).await.unwrap();
    let record = codec::primary_path(&store.entry_path("greeting"), false);
    fs::write(&record, "not json").unwrap();

    let err = store.get("greeting").await.unwrap_err();
    assert!(matches!(err, StoreError::Malformed(_)), "{err:?}");
}

#[tokio::test]
async fn test_zip_mode() {
    test::setup();
    let dir = test::tempdir();
    let store = DiskStore::new(StoreConfig {
        path: dir.path().to_owned(),
        zip: true,
        ..Default::default()
    })
    .unwrap();

    let payload = vec![5u8; 3000];
    store
        .set("blob", payload.clone().into(), None)
        .await
        .unwrap();

    let base = store.entry_path("blob");
    assert!(codec::primary_path(&base, true).is_file());

    assert_eq!(
        store.get("blob").await.unwrap(),
        Some(Value::Bytes(payload))
    );
    assert!(store.delete("blob").await.unwrap());
    assert_eq!(store.get("blob").await.unwrap(), None);
}
