mod fixtures;

use fixtures::*;

use evt::err::{OpenError, ReadError};
use evt::{EventType, LogFile, Session};
use pretty_assertions::assert_eq;

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

#[test]
fn test_resume_after_record() {
    ensure_env_logger_initialized();
    let store = TestStore::new();
    store.install("Application", "Source", None);
    for i in 0..5 {
        store.report("Source", EventType::Info, i, &[]);
    }

    let mut session = Session::open(&store.registry(), "Application", 3).unwrap();
    assert_eq!(session.last_record_number(), 3);
    assert_eq!(session.oldest_record_number().unwrap(), 1);
    assert_eq!(session.newest_record_number().unwrap(), 5);

    let batch = session.read_batch().unwrap();
    let numbers: Vec<u32> = batch.records.iter().map(|r| r.record_number).collect();
    assert_eq!(numbers, vec![4, 5]);
    assert_eq!(batch.last_record_number(), Some(5));
}

#[test]
fn test_large_record_is_read_whole() {
    let store = TestStore::new();
    let big = "x".repeat(10_000);
    store.report("Source", EventType::Error, 1, &[big.as_str(), "small"]);
    store.report("Source", EventType::Error, 2, &["after"]);

    let mut session = Session::open(&store.registry(), "Application", 0)
        .unwrap()
        .with_batch_limits(10, 256);

    let batch = session.read_batch().unwrap();
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.records[0].parameters[0].len(), 10_000);
    assert_eq!(batch.records[0].parameters[1], "small");

    let batch = session.read_batch().unwrap();
    assert_eq!(batch.records[0].parameters, vec!["after"]);
}

#[test]
fn test_corrupt_record_length_is_reported() {
    let store = TestStore::new();
    store.report("Source", EventType::Info, 1, &["a"]);

    let mut file = OpenOptions::new()
        .write(true)
        .open(store.log_path("Application"))
        .unwrap();
    file.seek(SeekFrom::Start(0x30)).unwrap();
    file.write_all(&4_u32.to_le_bytes()).unwrap();
    drop(file);

    let mut session = Session::open(&store.registry(), "Application", 0).unwrap();
    assert!(matches!(
        session.read_batch(),
        Err(ReadError::Corrupt { offset: 0x30, .. })
    ));
}

#[test]
fn test_foreign_file_cannot_be_opened() {
    let store = TestStore::new();
    store.file("Application.evt", &[0xAB; 0x80]);

    assert!(matches!(
        Session::open(&store.registry(), "Application", 0),
        Err(OpenError::LogFile { .. })
    ));
    assert!(LogFile::open_or_create(store.log_path("Application"), 0).is_err());
}

#[test]
fn test_sessions_on_the_same_log_are_independent() {
    let store = TestStore::new();
    store.report("Source", EventType::Info, 1, &[]);

    let mut first = Session::open(&store.registry(), "Application", 0).unwrap();
    let mut second = Session::open(&store.registry(), "Application", 0).unwrap();
    assert_eq!(first.read_batch().unwrap().records.len(), 1);
    assert!(first.read_batch().unwrap().is_empty());

    store.report("Source", EventType::Info, 2, &[]);
    assert_eq!(second.read_batch().unwrap().records.len(), 2);
    assert_eq!(first.read_batch().unwrap().records.len(), 1);
    first.close();
    assert!(matches!(first.read_batch(), Err(ReadError::Closed)));
    assert_eq!(second.record_count().unwrap(), 2);
}

#[test]
fn test_skipped_record_keeps_sequence() {
    let store = TestStore::new();
    for i in 1..=3 {
        store.report("Source", EventType::Info, i, &["x"]);
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(store.log_path("Application"))
        .unwrap();
    let mut length = [0_u8; 4];
    file.seek(SeekFrom::Start(0x30)).unwrap();
    file.read_exact(&mut length).unwrap();
    let second = 0x30 + u64::from(u32::from_le_bytes(length));
    file.seek(SeekFrom::Start(second + 0x08)).unwrap();
    file.write_all(&0xFFFF_FFF0_u32.to_le_bytes()).unwrap();
    file.seek(SeekFrom::Start(second + 0x18)).unwrap();
    file.write_all(&3_u16.to_le_bytes()).unwrap();
    drop(file);

    let mut session = Session::open(&store.registry(), "Application", 0).unwrap();
    let batch = session.read_batch().unwrap();
    let numbers: Vec<u32> = batch.records.iter().map(|r| r.record_number).collect();
    assert_eq!(numbers, vec![1, 3]);
    assert_eq!(batch.skipped.len(), 1);
    assert_eq!(batch.skipped[0].offset, second);
    assert_eq!(batch.skipped[0].record_number, None);
    assert_eq!(batch.last_record_number(), Some(3));
    assert_eq!(session.last_record_number(), 3);
}
