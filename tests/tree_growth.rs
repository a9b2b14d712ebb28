//! Split propagation, deep trees, merge on erase.

use coffer::{DbOptions, EnvOptions, Environment, KeyType};

fn fixed_key(i: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[8..].copy_from_slice(&i.to_be_bytes());
    key
}

#[test]
fn splits_propagate_until_the_tree_is_three_levels_deep() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env
        .create_db(
            1,
            DbOptions::new().key_type(KeyType::Binary).key_size(16),
        )
        .unwrap();

    // 1 KiB pages hold ~39 fixed 16-byte keys per leaf; 3000 keys force
    // two levels of internal nodes above the leaves
    const N: u64 = 3000;
    for i in 0..N {
        db.insert(&fixed_key(i), b"v").unwrap();
    }

    let metrics = env.metrics();
    assert!(metrics.btree_splits > 80, "splits: {}", metrics.btree_splits);

    for i in 0..N {
        assert!(db.find(&fixed_key(i)).unwrap().is_some(), "key {}", i);
    }
    assert_eq!(db.count(true).unwrap(), N);

    // leaf order is big-endian numeric order
    let mut prev: Option<Vec<u8>> = None;
    let mut seen = 0u64;
    db.scan(|key, _| {
        if let Some(p) = &prev {
            assert!(p.as_slice() < key, "scan out of order");
        }
        prev = Some(key.to_vec());
        seen += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, N);

    db.check_integrity().unwrap();
}

#[test]
fn interleaved_inserts_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interleave.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env
        .create_db(1, DbOptions::new().key_size(16))
        .unwrap();

    // alternate low/high halves so splits land in the middle of the
    // key space, not just at the right edge
    const N: u64 = 1000;
    for i in 0..N / 2 {
        db.insert(&fixed_key(i), b"lo").unwrap();
        db.insert(&fixed_key(N - 1 - i), b"hi").unwrap();
    }

    assert_eq!(db.count(true).unwrap(), N);
    for i in 0..N {
        assert!(db.find(&fixed_key(i)).unwrap().is_some(), "key {}", i);
    }
    db.check_integrity().unwrap();
}

#[test]
fn erasing_most_keys_merges_nodes_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merge.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env
        .create_db(1, DbOptions::new().key_size(16))
        .unwrap();

    const N: u64 = 1500;
    for i in 0..N {
        db.insert(&fixed_key(i), b"v").unwrap();
    }

    // erase all but every 50th key; underflowing leaves merge or shift
    for i in 0..N {
        if i % 50 != 0 {
            db.erase(&fixed_key(i)).unwrap();
        }
    }

    let metrics = env.metrics();
    assert!(metrics.btree_merges > 0, "merges: {}", metrics.btree_merges);

    assert_eq!(db.count(true).unwrap(), N / 50);
    for i in 0..N {
        let expect = i % 50 == 0;
        assert_eq!(db.find(&fixed_key(i)).unwrap().is_some(), expect, "key {}", i);
    }
    db.check_integrity().unwrap();
}

#[test]
fn erase_everything_then_reuse_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drain.cfr");
    let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
    let db = env
        .create_db(1, DbOptions::new().key_size(16))
        .unwrap();

    for round in 0..3u64 {
        for i in 0..400 {
            db.insert(&fixed_key(round * 10_000 + i), b"v").unwrap();
        }
        for i in 0..400 {
            db.erase(&fixed_key(round * 10_000 + i)).unwrap();
        }
        assert_eq!(db.count(true).unwrap(), 0);
        db.check_integrity().unwrap();
    }
}

#[test]
fn deep_tree_survives_close_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deep_persist.cfr");

    const N: u64 = 2000;
    {
        let env = Environment::create(&path, EnvOptions::new().page_size(1024)).unwrap();
        let db = env
            .create_db(1, DbOptions::new().key_size(16))
            .unwrap();
        for i in 0..N {
            db.insert(&fixed_key(i), &i.to_le_bytes()).unwrap();
        }
        drop(db);
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(true).unwrap(), N);
    for i in (0..N).step_by(97) {
        assert_eq!(
            db.find(&fixed_key(i)).unwrap().unwrap(),
            i.to_le_bytes().to_vec()
        );
    }
    db.check_integrity().unwrap();
}
