//! Crash recovery: journal replay restores committed changes that never
//! reached the data file, torn journal tails are discarded, and a
//! non-empty journal without auto-recovery refuses to open.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use coffer::{DbOptions, EnvOptions, Environment, ErrorKind};

const PAGE_SIZE: usize = 1024;

/// Builds an environment with 100 committed keys, then abandons it
/// without a clean close, leaving the journal populated.
fn crash_with_keys(path: &std::path::Path) {
    let env = Environment::create(path, EnvOptions::new().page_size(PAGE_SIZE)).unwrap();
    let db = env.create_db(1, DbOptions::new()).unwrap();
    for i in 0..100u32 {
        let key = format!("key-{:03}", i).into_bytes();
        db.insert(&key, &i.to_le_bytes()).unwrap();
    }
    drop(db);
    // simulate the process dying: no close, no journal truncation
    std::mem::forget(env);
}

/// Wipes every page after page 0, as if the data-file writes never made
/// it to disk. Page 0 survives so open can read the header; everything
/// else must come back from the journal.
fn lose_data_pages(path: &std::path::Path) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.seek(SeekFrom::Start(PAGE_SIZE as u64)).unwrap();
    let zeros = vec![0u8; (len as usize).saturating_sub(PAGE_SIZE)];
    file.write_all(&zeros).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn auto_recovery_replays_committed_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s5.cfr");
    crash_with_keys(&path);
    lose_data_pages(&path);

    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    assert!(env.metrics().recovery_replays > 0);

    let db = env.open_db(1).unwrap();
    for i in 0..100u32 {
        let key = format!("key-{:03}", i).into_bytes();
        assert_eq!(
            db.find(&key).unwrap().unwrap(),
            i.to_le_bytes().to_vec(),
            "key {} lost in recovery",
            i
        );
    }
    db.check_integrity().unwrap();
}

#[test]
fn recovery_without_auto_recovery_reports_need_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("needrec.cfr");
    crash_with_keys(&path);

    let err = Environment::open(&path, EnvOptions::new().auto_recovery(false)).unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::NeedRecovery));

    // a second open with recovery enabled proceeds normally
    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(true).unwrap(), 100);
}

#[test]
fn torn_journal_tail_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.cfr");
    crash_with_keys(&path);

    // garbage half-record at the journal tail, as a torn write leaves it
    for suffix in ["torn.cfr.jrn0", "torn.cfr.jrn1"] {
        let jpath = dir.path().join(suffix);
        if jpath.exists() {
            let mut file = OpenOptions::new().append(true).open(&jpath).unwrap();
            file.write_all(&[0xFF; 11]).unwrap();
        }
    }
    lose_data_pages(&path);

    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(true).unwrap(), 100);
    db.check_integrity().unwrap();
}

#[test]
fn recovery_is_idempotent_across_repeated_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idem.cfr");
    crash_with_keys(&path);
    lose_data_pages(&path);

    {
        let env = Environment::open(&path, EnvOptions::new()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.count(true).unwrap(), 100);
        drop(db);
        env.close().unwrap();
    }

    // clean close truncated the journal; the next open has nothing to do
    let env = Environment::open(&path, EnvOptions::new()).unwrap();
    assert_eq!(env.metrics().recovery_replays, 0);
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(true).unwrap(), 100);
}

#[test]
fn clean_close_leaves_an_empty_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.cfr");
    {
        let env = Environment::create(&path, EnvOptions::new().page_size(PAGE_SIZE)).unwrap();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(b"k", b"v").unwrap();
        drop(db);
        env.close().unwrap();
    }

    // both journal files exist but hold only their 16-byte headers
    for suffix in ["clean.cfr.jrn0", "clean.cfr.jrn1"] {
        let len = std::fs::metadata(dir.path().join(suffix)).unwrap().len();
        assert_eq!(len, 16, "{} not truncated", suffix);
    }
}

#[test]
fn dont_clear_log_keeps_journal_content_at_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keeplog.cfr");
    {
        let env = Environment::create(
            &path,
            EnvOptions::new().page_size(PAGE_SIZE).dont_clear_log(true),
        )
        .unwrap();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(b"k", b"v").unwrap();
        drop(db);
        env.close().unwrap();
    }

    let total: u64 = ["keeplog.cfr.jrn0", "keeplog.cfr.jrn1"]
        .iter()
        .map(|s| std::fs::metadata(dir.path().join(s)).unwrap().len())
        .sum();
    assert!(total > 32, "journal content was cleared: {} bytes", total);
}

#[test]
fn journaling_disabled_still_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nojournal.cfr");
    {
        let env = Environment::create(
            &path,
            EnvOptions::new().page_size(PAGE_SIZE).enable_journal(false),
        )
        .unwrap();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        for i in 0..50u32 {
            db.insert(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        drop(db);
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvOptions::new().enable_journal(false)).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(true).unwrap(), 50);
}
