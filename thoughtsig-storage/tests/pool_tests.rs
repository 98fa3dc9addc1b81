//! Reader pool tests

use std::path::Path;
use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use tempfile::TempDir;

use thoughtsig_storage::format::{data_path, index_path};
use thoughtsig_storage::{PoolConfig, ReaderPool, Writer};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
}

fn seed_days(dir: &Path, days: u32) {
    for d in 1..=days {
        let writer = Writer::open(dir, day(d)).unwrap();
        writer
            .write(&format!("req:{d}"), format!("payload for day {d}").as_bytes())
            .unwrap();
    }
}

fn pool(dir: &Path, max_open: usize) -> ReaderPool {
    ReaderPool::new(
        dir,
        PoolConfig {
            max_open,
            ..Default::default()
        },
    )
}

#[test]
fn test_eviction_under_pressure() {
    let dir = TempDir::new().unwrap();
    seed_days(dir.path(), 6);
    let pool = pool(dir.path(), 2);

    for d in 1..=6 {
        let handle = pool.acquire(day(d)).unwrap();
        assert_eq!(
            handle.load(&format!("req:{d}")).unwrap(),
            format!("payload for day {d}").as_bytes()
        );
    }

    let stats = pool.stats();
    assert_eq!(stats.open_readers, 2);
    assert_eq!(stats.evictions, 4);
    assert_eq!(stats.misses, 6);
    // Most recently used days survive.
    assert!(pool.is_open(day(5)));
    assert!(pool.is_open(day(6)));
    assert!(!pool.is_open(day(1)));
}

#[test]
fn test_recently_used_reader_is_kept() {
    let dir = TempDir::new().unwrap();
    seed_days(dir.path(), 3);
    let pool = pool(dir.path(), 2);

    pool.acquire(day(1)).unwrap();
    pool.acquire(day(2)).unwrap();
    // Touch day 1 so day 2 becomes the eviction candidate.
    pool.acquire(day(1)).unwrap();
    pool.acquire(day(3)).unwrap();

    assert!(pool.is_open(day(1)));
    assert!(!pool.is_open(day(2)));
    assert!(pool.is_open(day(3)));
    assert_eq!(pool.stats().hits, 1);
}

#[test]
fn test_referenced_reader_is_never_evicted() {
    let dir = TempDir::new().unwrap();
    seed_days(dir.path(), 3);
    let pool = pool(dir.path(), 1);

    let held = pool.acquire(day(1)).unwrap();
    let other = pool.acquire(day(2)).unwrap();
    // Both in use: the pool runs over its cap instead of closing either.
    assert_eq!(pool.stats().open_readers, 2);

    drop(other);
    assert!(!pool.is_open(day(2)));
    assert!(pool.is_open(day(1)));

    pool.acquire(day(3)).unwrap();
    assert!(pool.is_open(day(1)));
    assert_eq!(held.load("req:1").unwrap(), b"payload for day 1");

    drop(held);
    assert_eq!(pool.stats().open_readers, 1);
}

#[test]
fn test_delete_date_removes_files_and_reader() {
    let dir = TempDir::new().unwrap();
    seed_days(dir.path(), 2);
    let pool = pool(dir.path(), 4);

    pool.acquire(day(1)).unwrap();
    assert!(pool.is_open(day(1)));

    pool.delete_date(day(1)).unwrap();
    assert!(!pool.is_open(day(1)));
    assert!(!data_path(dir.path(), day(1)).exists());
    assert!(!index_path(dir.path(), day(1)).exists());
    assert!(pool.acquire(day(1)).is_err());

    // Deleting a day with no files is not an error.
    pool.delete_date(day(20)).unwrap();
    assert!(pool.acquire(day(2)).is_ok());
}

#[test]
fn test_handle_outlives_deletion() {
    let dir = TempDir::new().unwrap();
    seed_days(dir.path(), 1);
    let pool = pool(dir.path(), 4);

    let handle = pool.acquire(day(1)).unwrap();
    pool.delete_date(day(1)).unwrap();
    // Reopening after deletion fails; the old handle still reads its open file.
    assert!(pool.acquire(day(1)).is_err());
    assert_eq!(handle.load("req:1").unwrap(), b"payload for day 1");
    drop(handle);
    assert_eq!(pool.stats().open_readers, 0);
}

#[test]
fn test_concurrent_acquire() {
    let dir = TempDir::new().unwrap();
    seed_days(dir.path(), 4);
    let pool = Arc::new(pool(dir.path(), 2));

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let d = (t + i) % 4 + 1;
                    let handle = pool.acquire(day(d)).unwrap();
                    assert_eq!(
                        handle.load(&format!("req:{d}")).unwrap(),
                        format!("payload for day {d}").as_bytes()
                    );
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert!(stats.open_readers <= 2, "open readers: {}", stats.open_readers);
    assert_eq!(stats.hits + stats.misses, 400);
}
