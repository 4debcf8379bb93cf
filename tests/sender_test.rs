// ABOUTME: Integration tests for SyncSender - cursor handling, schema policy and failure behavior
// ABOUTME: Uses an in-memory source and an in-process receiver behind the Dialer trait

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ChannelDialer, Fault, MemorySource, MemoryTarget, TABLE};
use table_relay::sync::{
    Cursor, CursorFile, CursorState, SchemaPolicy, SenderOptions, SyncSender,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

fn options(policy: SchemaPolicy) -> SenderOptions {
    SenderOptions {
        interval: Duration::from_millis(20),
        schema_policy: policy,
        ..SenderOptions::default()
    }
}

async fn sender(
    source: &MemorySource,
    dialer: &Arc<ChannelDialer>,
    dir: &TempDir,
    policy: SchemaPolicy,
) -> SyncSender<MemorySource, Arc<ChannelDialer>> {
    SyncSender::open(
        source.clone(),
        Arc::clone(dialer),
        CursorFile::new(dir.path().join("cursor.json")),
        options(policy),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_first_cycle_sends_schema_and_all_rows() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=3);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;

    assert_eq!(sender.cursor(), None);
    let report = sender.run_cycle().await.unwrap();

    assert!(report.transmitted);
    assert!(report.schema_sent);
    assert_eq!(report.rows, 3);
    assert_eq!(report.cursor, Some(Cursor(3)));
    assert_eq!(sender.cursor(), Some(Cursor(3)));

    dialer.reports().await;
    assert_eq!(target.ids(), vec![1, 2, 3]);
    assert_eq!(target.creates(), 1);

    let saved = CursorFile::new(dir.path().join("cursor.json"))
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.table, TABLE);
    assert_eq!(saved.cursor, Cursor(3));
    assert_eq!(saved.last_row_count, 3);
}

#[tokio::test]
async fn test_empty_cycle_opens_no_connection() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=2);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;

    sender.run_cycle().await.unwrap();
    assert_eq!(dialer.dials(), 1);

    let report = sender.run_cycle().await.unwrap();
    assert!(!report.transmitted);
    assert_eq!(report.rows, 0);
    assert_eq!(report.cursor, Some(Cursor(2)));
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn test_incremental_cycle_sends_only_new_rows_without_schema() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=3);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;

    sender.run_cycle().await.unwrap();
    source.insert([4, 5]);
    let report = sender.run_cycle().await.unwrap();

    assert_eq!(report.rows, 2);
    assert!(!report.schema_sent);
    assert_eq!(report.cursor, Some(Cursor(5)));
    assert_eq!(source.schema_reads(), 1);

    dialer.reports().await;
    assert_eq!(target.ids(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_every_frame_policy_attaches_schema_each_time() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids([1]);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::EveryFrame).await;

    assert!(sender.run_cycle().await.unwrap().schema_sent);
    source.insert([2]);
    assert!(sender.run_cycle().await.unwrap().schema_sent);
    assert_eq!(source.schema_reads(), 2);

    // No rows means no frame, schema or not.
    let report = sender.run_cycle().await.unwrap();
    assert!(!report.transmitted);
    assert_eq!(dialer.dials(), 2);
    assert_eq!(source.schema_reads(), 2);

    dialer.reports().await;
    // Receiving the schema again never recreates the table.
    assert_eq!(target.creates(), 1);
    assert_eq!(target.ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_dial_failure_keeps_cursor() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=3);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;

    dialer.inject(Fault::Refuse);
    let err = sender.run_cycle().await.unwrap_err();
    assert_eq!(err.kind(), "connection_failure");
    assert_eq!(sender.cursor(), None);
    assert!(CursorFile::new(dir.path().join("cursor.json"))
        .load()
        .await
        .unwrap()
        .is_none());

    // The schema was never delivered, so it goes out with the retry.
    let report = sender.run_cycle().await.unwrap();
    assert!(report.schema_sent);
    assert_eq!(report.rows, 3);
    dialer.reports().await;
    assert_eq!(target.ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_extraction_failure_keeps_cursor_and_skips_dial() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=2);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;

    sender.run_cycle().await.unwrap();
    source.insert([3]);
    source.fail_next(1);

    let err = sender.run_cycle().await.unwrap_err();
    assert_eq!(err.kind(), "source_unavailable");
    assert_eq!(sender.cursor(), Some(Cursor(2)));
    assert_eq!(dialer.dials(), 1);

    assert_eq!(sender.run_cycle().await.unwrap().cursor, Some(Cursor(3)));
}

#[tokio::test]
async fn test_restart_resumes_from_saved_cursor() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=3);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));

    let mut first = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;
    first.run_cycle().await.unwrap();
    drop(first);

    let mut second = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;
    assert_eq!(second.cursor(), Some(Cursor(3)));

    // A new process re-sends the schema even with nothing new to ship.
    let report = second.run_cycle().await.unwrap();
    assert!(report.transmitted);
    assert!(report.schema_sent);
    assert_eq!(report.rows, 0);
    assert_eq!(report.cursor, Some(Cursor(3)));

    dialer.reports().await;
    assert_eq!(target.ids(), vec![1, 2, 3]);
    assert_eq!(target.creates(), 1);
}

#[tokio::test]
async fn test_corrupt_cursor_file_fails_startup() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("cursor.json"), "not json").unwrap();
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(target));

    let result = SyncSender::open(
        MemorySource::new(),
        dialer,
        CursorFile::new(dir.path().join("cursor.json")),
        SenderOptions::default(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cursor_file_for_other_table_fails_startup() {
    let dir = TempDir::new().unwrap();
    let store = CursorFile::new(dir.path().join("cursor.json"));
    store
        .save(&CursorState::new("orders", Cursor(10), 1))
        .await
        .unwrap();
    let dialer = Arc::new(ChannelDialer::new(MemoryTarget::new()));

    let result = SyncSender::open(MemorySource::new(), dialer, store, SenderOptions::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_loop_ships_rows_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=2);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = sender(&source, &dialer, &dir, SchemaPolicy::Once).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = tokio::spawn(async move {
        sender.run(shutdown_rx).await.unwrap();
        sender
    });

    common::wait_until(|| target.ids().len() == 2).await;
    source.insert([3]);
    common::wait_until(|| target.ids().len() == 3).await;

    shutdown_tx.send(()).unwrap();
    let sender = running.await.unwrap();
    assert_eq!(sender.cursor(), Some(Cursor(3)));
    assert_eq!(target.ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_receiver_that_stops_reading_times_out_the_cycle() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=3);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = SyncSender::open(
        source.clone(),
        Arc::clone(&dialer),
        CursorFile::new(dir.path().join("cursor.json")),
        SenderOptions {
            transmit_timeout: Duration::from_millis(100),
            ..options(SchemaPolicy::Once)
        },
    )
    .await
    .unwrap();

    dialer.inject(Fault::Stall);
    let err = tokio::time::timeout(Duration::from_secs(2), sender.run_cycle())
        .await
        .expect("cycle hung on a stalled receiver")
        .unwrap_err();
    assert_eq!(err.kind(), "connection_failure");
    assert!(err.to_string().contains("Timed out"), "{err}");
    assert_eq!(sender.cursor(), None);
    assert!(CursorFile::new(dir.path().join("cursor.json"))
        .load()
        .await
        .unwrap()
        .is_none());
    dialer.reports().await;
    assert!(target.rows().is_empty());

    // The next cycle resends everything.
    let report = sender.run_cycle().await.unwrap();
    assert_eq!(report.rows, 3);
    dialer.reports().await;
    assert_eq!(target.ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_shutdown_is_honored_while_receiver_stalls() {
    let dir = TempDir::new().unwrap();
    let source = MemorySource::with_ids(1..=2);
    let target = MemoryTarget::new();
    let dialer = Arc::new(ChannelDialer::new(Arc::clone(&target)));
    let mut sender = SyncSender::open(
        source.clone(),
        Arc::clone(&dialer),
        CursorFile::new(dir.path().join("cursor.json")),
        SenderOptions {
            interval: Duration::from_secs(60),
            transmit_timeout: Duration::from_millis(100),
            ..SenderOptions::default()
        },
    )
    .await
    .unwrap();

    dialer.inject(Fault::Stall);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = tokio::spawn(async move {
        sender.run(shutdown_rx).await.unwrap();
        sender
    });

    common::wait_until(|| dialer.dials() == 1).await;
    shutdown_tx.send(()).unwrap();
    let sender = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("sender did not stop")
        .unwrap();
    assert_eq!(sender.cursor(), None);
}
