//! Keys past the extended threshold move to blobs; lookups and ordering
//! still work through the blob indirection.

use coffer::{DbOptions, EnvOptions, Environment};

#[test]
fn oversized_key_goes_extended_and_still_finds_its_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env.create_db(1, DbOptions::new()).unwrap();

    // 1 KiB pages put the extended threshold at 64 bytes
    let big_key = vec![0x61u8; 1024];
    db.insert(&big_key, b"x").unwrap();

    assert_eq!(env.metrics().extended_keys, 1);
    assert_eq!(db.find(&big_key).unwrap().unwrap(), b"x");
    db.check_integrity().unwrap();
}

#[test]
fn extended_keys_keep_their_sort_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext_order.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env.create_db(1, DbOptions::new()).unwrap();

    // mix of short and long keys sharing long prefixes
    let mut keys: Vec<Vec<u8>> = Vec::new();
    for i in 0..60u32 {
        let mut key = vec![b'p'; 100];
        key.extend_from_slice(format!("{:04}", i).as_bytes());
        keys.push(key);
        keys.push(format!("s{:04}", i).into_bytes());
    }
    for key in &keys {
        db.insert(key, b"v").unwrap();
    }

    assert!(env.metrics().extended_keys >= 60);

    let mut sorted = keys.clone();
    sorted.sort();
    let mut scanned = Vec::new();
    db.scan(|k, _| {
        scanned.push(k.to_vec());
        Ok(())
    })
    .unwrap();
    assert_eq!(scanned, sorted);
    db.check_integrity().unwrap();
}

#[test]
fn erasing_extended_keys_releases_their_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext_erase.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env.create_db(1, DbOptions::new()).unwrap();

    let keys: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 300]).collect();
    for key in &keys {
        db.insert(key, b"v").unwrap();
    }
    for key in &keys {
        db.erase(key).unwrap();
    }

    let metrics = env.metrics();
    assert!(
        metrics.blob_frees >= 20,
        "extended key blobs freed: {}",
        metrics.blob_frees
    );
    assert_eq!(db.count(true).unwrap(), 0);
}

#[test]
fn extended_keys_survive_close_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext_persist.cfr");

    let big_key = vec![0x42u8; 500];
    {
        let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(&big_key, b"payload").unwrap();
        drop(db);
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(&big_key).unwrap().unwrap(), b"payload");
}

#[test]
fn large_records_round_trip_through_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big_records.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env.create_db(1, DbOptions::new()).unwrap();

    let record: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    db.insert(b"big", &record).unwrap();

    assert_eq!(db.find(b"big").unwrap().unwrap(), record);

    // overwrite with a small record frees the old blob
    let frees_before = env.metrics().blob_frees;
    db.insert_with(b"big", b"tiny", coffer::InsertFlags::Overwrite)
        .unwrap();
    assert_eq!(db.find(b"big").unwrap().unwrap(), b"tiny");
    assert!(env.metrics().blob_frees > frees_before);
}
