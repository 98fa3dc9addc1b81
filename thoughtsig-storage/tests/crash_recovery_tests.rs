//! # Crash Recovery Tests
//!
//! Tests for:
//! - Index rebuild after restart
//! - Recovery window (`recovery_days`)
//! - Torn index tails left by a crash
//! - Lazy payload loading for recovered pointers

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::TempDir;

use thoughtsig_core::{encode_entry, Entry, SignatureCacheConfig};
use thoughtsig_storage::format::index_path;
use thoughtsig_storage::{local_today, Manager, Writer};

fn config(dir: &Path) -> SignatureCacheConfig {
    SignatureCacheConfig {
        flush_interval: Duration::from_secs(3600),
        ..SignatureCacheConfig::with_data_dir(dir)
    }
}

fn seed_day(signatures_dir: &Path, date: NaiveDate, entries: &[Entry]) {
    let writer = Writer::open(signatures_dir, date).unwrap();
    for entry in entries {
        writer.write(&entry.key(), &encode_entry(entry).unwrap()).unwrap();
    }
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_recovers_all_entries() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());

    {
        let manager = Manager::open(cfg.clone()).await.unwrap();
        for i in 0..50 {
            manager
                .save(&format!("r{i}"), &format!("call_{i}"), &format!("sig-{i}"), "why", "m")
                .await
                .unwrap();
        }
        manager.close().await.unwrap();
    }

    let manager = Manager::open(cfg).await.unwrap();
    let stats = manager.stats();
    assert_eq!(stats.indexed, 50);
    assert_eq!(stats.metrics.recovered_entries, 50);
    assert_eq!(stats.hot, 0);

    for i in 0..50 {
        let entry = manager.lookup(&format!("r{i}"), &format!("call_{i}")).unwrap();
        assert_eq!(entry.signature, format!("sig-{i}"));
        assert_eq!(entry.reasoning, "why");
    }
    assert_eq!(
        manager.lookup_by_tool_call_id("call_7").unwrap().signature,
        "sig-7"
    );
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_keeps_last_write() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());

    {
        let manager = Manager::open(cfg.clone()).await.unwrap();
        manager.save("r1", "call_1", "sig-a", "", "m").await.unwrap();
        manager.flush().await.unwrap();
        manager.save("r1", "call_1", "sig-b", "", "m").await.unwrap();
        manager.close().await.unwrap();
    }

    let manager = Manager::open(cfg).await.unwrap();
    assert_eq!(manager.lookup("r1", "call_1").unwrap().signature, "sig-b");
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_recovered_entry_supports_prefix_lookup() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    {
        let manager = Manager::open(cfg.clone()).await.unwrap();
        manager.save("r1", "call_1", "prefix-XYZ-tail", "", "m").await.unwrap();
        manager.close().await.unwrap();
    }

    let manager = Manager::open(cfg).await.unwrap();
    assert!(manager
        .lookup_by_tool_call_id_and_signature_prefix("call_1", "prefix-ABC")
        .is_none());
    assert!(manager
        .lookup_by_tool_call_id_and_signature_prefix("call_1", "prefix-XYZ")
        .is_some());
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_reading_older_request_keeps_tool_call_link() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    {
        let manager = Manager::open(cfg.clone()).await.unwrap();
        manager.save("r1", "call_1", "sig-old", "", "m").await.unwrap();
        manager.save("r2", "call_1", "sig-new", "", "m").await.unwrap();
        manager.close().await.unwrap();
    }

    let manager = Manager::open(cfg).await.unwrap();
    assert_eq!(manager.lookup_by_tool_call_id("call_1").unwrap().signature, "sig-new");
    assert_eq!(manager.lookup("r1", "call_1").unwrap().signature, "sig-old");
    assert_eq!(manager.lookup_by_tool_call_id("call_1").unwrap().signature, "sig-new");
    assert!(manager
        .lookup_by_tool_call_id_and_signature_prefix("call_1", "sig-new")
        .is_some());
    assert!(manager
        .lookup_by_tool_call_id_and_signature_prefix("call_1", "sig-old")
        .is_none());
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_tool_call_id_with_colon_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    {
        let manager = Manager::open(cfg.clone()).await.unwrap();
        manager.save("r1", "ns:call_1", "sig", "", "m").await.unwrap();
        manager.close().await.unwrap();
    }

    let manager = Manager::open(cfg).await.unwrap();
    assert_eq!(manager.lookup("r1", "ns:call_1").unwrap().signature, "sig");
    assert_eq!(manager.lookup_by_tool_call_id("ns:call_1").unwrap().request_id, "r1");
    manager.close().await.unwrap();
}

// =============================================================================
// Recovery window
// =============================================================================

#[tokio::test]
async fn test_recovery_window_skips_older_days() {
    let dir = TempDir::new().unwrap();
    let cfg = SignatureCacheConfig {
        recovery_days: 2,
        ..config(dir.path())
    };
    let signatures = cfg.signatures_dir();
    let today = local_today();

    // Four past days, each with one entry.
    for back in 1..=4i64 {
        let date = today - chrono::Duration::days(back);
        seed_day(
            &signatures,
            date,
            &[Entry::new(format!("r{back}"), format!("call_{back}"), "sig", "", "m")],
        );
    }

    let manager = Manager::open(cfg).await.unwrap();
    // Window covers today (empty) and yesterday.
    assert!(manager.lookup("r1", "call_1").is_some());
    assert!(manager.lookup("r2", "call_2").is_none());
    assert!(manager.lookup("r4", "call_4").is_none());
    assert_eq!(manager.stats().indexed, 1);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_past_day_served_through_reader_pool() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let signatures = cfg.signatures_dir();
    let yesterday = local_today() - chrono::Duration::days(1);
    let entry = Entry::new("r1", "call_1", "sig-yesterday", "", "m");
    seed_day(&signatures, yesterday, &[entry.clone()]);

    let manager = Manager::open(cfg).await.unwrap();
    assert_eq!(manager.lookup("r1", "call_1").unwrap(), entry);
    assert_eq!(manager.lookup("r1", "call_1").unwrap(), entry);

    let stats = manager.stats();
    assert_eq!(stats.reader_misses, 1);
    assert_eq!(stats.reader_hits, 1);
    assert_eq!(stats.open_readers, 1);

    manager.delete_day(yesterday).unwrap();
    assert_eq!(manager.stats().open_readers, 0);
    assert!(manager.lookup("r1", "call_1").is_none());
    manager.close().await.unwrap();
}

// =============================================================================
// Torn writes
// =============================================================================

#[tokio::test]
async fn test_torn_index_tail_after_crash() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let signatures = cfg.signatures_dir();

    {
        let manager = Manager::open(cfg.clone()).await.unwrap();
        manager.save("r1", "call_1", "sig-1", "", "m").await.unwrap();
        manager.save("r2", "call_2", "sig-2", "", "m").await.unwrap();
        manager.close().await.unwrap();
    }

    let mut index = OpenOptions::new()
        .append(true)
        .open(index_path(&signatures, local_today()))
        .unwrap();
    index.write_all(&[0x7F; 100]).unwrap();
    drop(index);

    let manager = Manager::open(cfg).await.unwrap();
    assert_eq!(manager.lookup("r1", "call_1").unwrap().signature, "sig-1");
    assert_eq!(manager.lookup("r2", "call_2").unwrap().signature, "sig-2");

    manager.save("r3", "call_3", "sig-3", "", "m").await.unwrap();
    manager.flush().await.unwrap();
    assert_eq!(manager.lookup("r3", "call_3").unwrap().signature, "sig-3");
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_record_reads_as_miss() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let signatures = cfg.signatures_dir();
    let yesterday = local_today() - chrono::Duration::days(1);
    seed_day(&signatures, yesterday, &[Entry::new("r1", "call_1", "sig", "", "m")]);

    // Clobber the length prefix of the only record.
    let data = thoughtsig_storage::format::data_path(&signatures, yesterday);
    let mut bytes = std::fs::read(&data).unwrap();
    bytes[0..4].copy_from_slice(&1u32.to_be_bytes());
    std::fs::write(&data, bytes).unwrap();

    let manager = Manager::open(cfg).await.unwrap();
    assert!(manager.lookup("r1", "call_1").is_none());
    let stats = manager.stats();
    assert_eq!(stats.metrics.corrupt_reads, 1);
    assert_eq!(stats.metrics.misses, 1);
    manager.close().await.unwrap();
}
