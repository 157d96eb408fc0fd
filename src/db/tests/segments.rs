use super::{sample_release, sample_segment};
use crate::aggregate::SegmentChange;
use crate::db::*;
use crate::error::DatabaseError;
use crate::Error;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_add_segment_updates_counters() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("some.release");
    db.upsert_release(&release).await.unwrap();

    let change = db.add_segment(&sample_segment(&release, 1, 700)).await.unwrap();
    assert_eq!(change, SegmentChange::Inserted);
    db.add_segment(&sample_segment(&release, 2, 300)).await.unwrap();

    let stored = db.get_release(&release.release_id).await.unwrap().unwrap();
    assert_eq!(stored.part_count, 2);
    assert_eq!(stored.size_bytes, 1000);
    assert!(stored.has_parts);

    let segments = db.get_segments(&release.release_id).await.unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].segment_number, 1);
    assert_eq!(segments[0].message_id, "part1.some.release@test");

    db.close().await;
}

#[tokio::test]
async fn test_duplicate_segment_is_a_no_op() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("some.release");
    db.upsert_release(&release).await.unwrap();

    let segment = sample_segment(&release, 1, 700);
    db.add_segment(&segment).await.unwrap();
    let change = db.add_segment(&segment).await.unwrap();
    assert_eq!(change, SegmentChange::Duplicate);

    let stored = db.get_release(&release.release_id).await.unwrap().unwrap();
    assert_eq!(stored.part_count, 1);
    assert_eq!(stored.size_bytes, 700);

    db.close().await;
}

#[tokio::test]
async fn test_segment_for_unknown_release_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("never.created");
    let result = db.add_segment(&sample_segment(&release, 1, 10)).await;
    assert!(result.is_err());
    assert!(db.get_segments(&release.release_id).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_remove_segment_clears_has_parts() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("some.release");
    db.upsert_release(&release).await.unwrap();
    db.add_segment(&sample_segment(&release, 1, 500)).await.unwrap();

    let change = db.remove_segment(&release.release_id, 1).await.unwrap();
    assert_eq!(change, SegmentChange::Removed);

    let stored = db.get_release(&release.release_id).await.unwrap().unwrap();
    assert_eq!(stored.part_count, 0);
    assert_eq!(stored.size_bytes, 0);
    assert!(!stored.has_parts);

    let change = db.remove_segment(&release.release_id, 1).await.unwrap();
    assert_eq!(change, SegmentChange::Absent);

    db.close().await;
}

#[tokio::test]
async fn test_update_segment_size() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("some.release");
    db.upsert_release(&release).await.unwrap();
    db.add_segment(&sample_segment(&release, 1, 0)).await.unwrap();
    db.add_segment(&sample_segment(&release, 2, 200)).await.unwrap();

    db.update_segment_size(&release.release_id, 1, 800).await.unwrap();

    let stored = db.get_release(&release.release_id).await.unwrap().unwrap();
    assert_eq!(stored.size_bytes, 1000);
    assert_eq!(stored.part_count, 2);

    let missing = db.update_segment_size(&release.release_id, 9, 1).await;
    assert!(matches!(
        missing,
        Err(Error::Database(DatabaseError::NotFound(_)))
    ));

    db.close().await;
}

#[tokio::test]
async fn test_recompute_release_counters() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("some.release");
    db.upsert_release(&release).await.unwrap();
    db.add_segment(&sample_segment(&release, 1, 100)).await.unwrap();

    sqlx::query("UPDATE releases SET part_count = 9, size_bytes = 1, has_parts = 0 WHERE release_id = ?")
        .bind(&release.release_id)
        .execute(db.pool())
        .await
        .unwrap();

    let counters = db.recompute_release_counters(&release.release_id).await.unwrap();
    assert_eq!(counters.part_count, 1);
    assert_eq!(counters.size_bytes, 100);
    assert!(counters.has_parts);

    let stored = db.get_release(&release.release_id).await.unwrap().unwrap();
    assert_eq!(stored.counters(), counters);

    let missing = "missing:2025-01-01".parse().unwrap();
    assert!(db.recompute_release_counters(&missing).await.is_err());

    db.close().await;
}

#[tokio::test]
async fn test_persist_batch_writes_everything_and_advances_cursor() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let a = sample_release("a.release");
    let b = sample_release("b.release");
    let batch = BatchWrite {
        group: "alt.binaries.test".to_string(),
        last_article: 102,
        releases: vec![a.clone(), b.clone()],
        segments: vec![
            sample_segment(&a, 1, 10),
            sample_segment(&a, 2, 20),
            sample_segment(&a, 2, 20),
            sample_segment(&b, 1, 5),
        ],
    };

    let outcome = db.persist_batch(&batch).await.unwrap();
    assert_eq!(outcome.inserted, 3);
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(outcome.changed, vec![a.release_id.clone(), b.release_id.clone()]);
    assert_eq!(db.get_cursor("alt.binaries.test").await.unwrap(), Some(102));

    let stored = db.get_release(&a.release_id).await.unwrap().unwrap();
    assert_eq!(stored.part_count, 2);
    assert_eq!(stored.size_bytes, 30);

    // Replaying the same batch changes nothing
    let replay = db.persist_batch(&batch).await.unwrap();
    assert_eq!(replay.inserted, 0);
    assert!(replay.changed.is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_failed_batch_leaves_cursor_untouched() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    db.advance_cursor("alt.binaries.test", 50).await.unwrap();

    // Segment references a release that is not part of the batch
    let orphan = sample_release("orphan.release");
    let batch = BatchWrite {
        group: "alt.binaries.test".to_string(),
        last_article: 200,
        releases: vec![sample_release("a.release")],
        segments: vec![sample_segment(&orphan, 1, 10)],
    };

    assert!(db.persist_batch(&batch).await.is_err());
    assert_eq!(db.get_cursor("alt.binaries.test").await.unwrap(), Some(50));
    let a = sample_release("a.release");
    assert!(db.get_release(&a.release_id).await.unwrap().is_none());

    db.close().await;
}

#[tokio::test]
async fn test_concurrent_adds_keep_counters_exact() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let release = sample_release("some.release");
    db.upsert_release(&release).await.unwrap();

    let mut handles = Vec::new();
    for n in 1..=20u32 {
        let db = db.clone();
        let segment = sample_segment(&release, n, u64::from(n));
        handles.push(tokio::spawn(async move { db.add_segment(&segment).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = db.get_release(&release.release_id).await.unwrap().unwrap();
    assert_eq!(stored.part_count, 20);
    assert_eq!(stored.size_bytes, (1..=20).sum::<i64>());
    assert!(stored.has_parts);

    db.close().await;
}
