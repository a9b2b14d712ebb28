//! Duplicate records: inline storage, migration to external tables,
//! position flags, per-duplicate erase.

use coffer::{DbOptions, EnvOptions, Environment, ErrorKind, InsertFlags};

fn dup_env(path: &std::path::Path) -> Environment {
    Environment::create(path, EnvOptions::new().page_size(1024)).unwrap()
}

#[test]
fn forty_duplicates_migrate_to_an_external_table() {
    let dir = tempfile::tempdir().unwrap();
    let env = dup_env(&dir.path().join("s2.cfr"));
    let db = env.create_db(1, DbOptions::new().duplicates(true)).unwrap();

    // 1 KiB pages put the inline duplicate threshold at 32
    let records: Vec<Vec<u8>> = (0..40u64).map(|i| i.to_le_bytes().to_vec()).collect();
    for r in &records {
        db.insert_with(b"k", r, InsertFlags::DuplicateLast).unwrap();
    }

    assert_eq!(env.metrics().extended_duptables, 1);
    assert_eq!(db.record_count(b"k").unwrap(), 40);
    for (i, r) in records.iter().enumerate() {
        assert_eq!(
            db.find_dup(b"k", i as u32).unwrap().as_deref(),
            Some(r.as_slice()),
            "duplicate {}",
            i
        );
    }
    db.check_integrity().unwrap();
}

#[test]
fn duplicate_position_flags_order_records() {
    let dir = tempfile::tempdir().unwrap();
    let env = dup_env(&dir.path().join("positions.cfr"));
    let db = env.create_db(1, DbOptions::new().duplicates(true)).unwrap();

    db.insert_with(b"k", b"c", InsertFlags::DuplicateLast).unwrap();
    db.insert_with(b"k", b"a", InsertFlags::DuplicateFirst).unwrap();
    db.insert_with(b"k", b"b", InsertFlags::DuplicateAfter(0)).unwrap();
    db.insert_with(b"k", b"d", InsertFlags::DuplicateBefore(3)).unwrap();

    let stored: Vec<Vec<u8>> = (0..4)
        .map(|i| db.find_dup(b"k", i).unwrap().unwrap())
        .collect();
    assert_eq!(stored, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec(), b"c".to_vec()]);
}

#[test]
fn plain_insert_appends_when_duplicates_are_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let env = dup_env(&dir.path().join("append.cfr"));
    let db = env.create_db(1, DbOptions::new().duplicates(true)).unwrap();

    db.insert(b"k", b"first").unwrap();
    db.insert(b"k", b"second").unwrap();

    assert_eq!(db.record_count(b"k").unwrap(), 2);
    assert_eq!(db.find_dup(b"k", 0).unwrap().unwrap(), b"first");
    assert_eq!(db.find_dup(b"k", 1).unwrap().unwrap(), b"second");
}

#[test]
fn erase_dup_removes_one_record_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let env = dup_env(&dir.path().join("erase_dup.cfr"));
    let db = env.create_db(1, DbOptions::new().duplicates(true)).unwrap();

    for r in [b"r0".as_slice(), b"r1", b"r2"] {
        db.insert_with(b"k", r, InsertFlags::DuplicateLast).unwrap();
    }

    db.erase_dup(b"k", 1).unwrap();
    assert_eq!(db.record_count(b"k").unwrap(), 2);
    assert_eq!(db.find_dup(b"k", 0).unwrap().unwrap(), b"r0");
    assert_eq!(db.find_dup(b"k", 1).unwrap().unwrap(), b"r2");

    // erasing the last record erases the key itself
    db.erase_dup(b"k", 0).unwrap();
    db.erase_dup(b"k", 0).unwrap();
    assert_eq!(db.find(b"k").unwrap(), None);
    assert_eq!(db.count(true).unwrap(), 0);
}

#[test]
fn erase_dup_inside_an_external_table() {
    let dir = tempfile::tempdir().unwrap();
    let env = dup_env(&dir.path().join("erase_table.cfr"));
    let db = env.create_db(1, DbOptions::new().duplicates(true)).unwrap();

    for i in 0..40u64 {
        db.insert_with(b"k", &i.to_le_bytes(), InsertFlags::DuplicateLast)
            .unwrap();
    }
    assert_eq!(env.metrics().extended_duptables, 1);

    db.erase_dup(b"k", 10).unwrap();
    assert_eq!(db.record_count(b"k").unwrap(), 39);
    assert_eq!(
        db.find_dup(b"k", 10).unwrap().unwrap(),
        11u64.to_le_bytes().to_vec()
    );

    // erase the whole key; the table and its records go with it
    db.erase(b"k").unwrap();
    assert_eq!(db.find(b"k").unwrap(), None);
    db.check_integrity().unwrap();
}

#[test]
fn duplicates_survive_close_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup_persist.cfr");
    {
        let env = dup_env(&path);
        let db = env.create_db(1, DbOptions::new().duplicates(true)).unwrap();
        for i in 0..40u64 {
            db.insert_with(b"k", &i.to_le_bytes(), InsertFlags::DuplicateLast)
                .unwrap();
        }
        drop(db);
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.record_count(b"k").unwrap(), 40);
    for i in 0..40u64 {
        assert_eq!(
            db.find_dup(b"k", i as u32).unwrap().unwrap(),
            i.to_le_bytes().to_vec()
        );
    }
}

#[test]
fn duplicate_flags_need_a_duplicate_database() {
    let dir = tempfile::tempdir().unwrap();
    let env = dup_env(&dir.path().join("nodups.cfr"));
    let db = env.create_db(1, DbOptions::new()).unwrap();
    db.insert(b"k", b"v").unwrap();

    let err = db
        .insert_with(b"k", b"w", InsertFlags::DuplicateLast)
        .unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidParameter));
}
