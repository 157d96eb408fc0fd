//! Segment writes with transactional counter aggregation.
//!
//! Every path that inserts, deletes or resizes a segment reads the owning
//! release's counters, applies the matching [`ReleaseCounters`] function and
//! writes them back before the transaction commits. The segment write comes
//! first so SQLite's write lock is held for the read-modify-write.

use crate::aggregate::{ReleaseCounters, SegmentChange};
use crate::error::DatabaseError;
use crate::types::ReleaseId;
use crate::{Error, Result};
use chrono::Utc;
use sqlx::SqliteConnection;

use super::{BatchOutcome, BatchWrite, Database, NewSegment, Segment, query_failed};

impl Database {
    /// Insert a segment and update its release's counters atomically
    ///
    /// A segment already stored for `(release_id, segment_number)` is a no-op
    /// and returns [`SegmentChange::Duplicate`].
    pub async fn add_segment(&self, segment: &NewSegment) -> Result<SegmentChange> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin transaction"))?;

        let change = insert_segment(&mut *tx, segment, Utc::now().timestamp()).await?;

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit segment insert"))?;
        Ok(change)
    }

    /// Delete a segment and update its release's counters atomically
    pub async fn remove_segment(
        &self,
        release_id: &ReleaseId,
        segment_number: u32,
    ) -> Result<SegmentChange> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin transaction"))?;

        let removed: Option<i64> = sqlx::query_scalar(
            "DELETE FROM segments WHERE release_id = ? AND segment_number = ? RETURNING size_bytes",
        )
        .bind(release_id)
        .bind(i64::from(segment_number))
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_failed("Failed to delete segment"))?;

        let Some(size) = removed else {
            return Ok(SegmentChange::Absent);
        };

        let counters = load_counters(&mut *tx, release_id).await?;
        store_counters(
            &mut *tx,
            release_id,
            counters.with_removed(size as u64),
            Utc::now().timestamp(),
        )
        .await?;

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit segment delete"))?;
        Ok(SegmentChange::Removed)
    }

    /// Record a segment's size once it becomes known
    pub async fn update_segment_size(
        &self,
        release_id: &ReleaseId,
        segment_number: u32,
        size_bytes: u64,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin transaction"))?;

        let now = Utc::now().timestamp();
        lock_release(&mut *tx, release_id, now).await?;

        let old: Option<i64> = sqlx::query_scalar(
            "SELECT size_bytes FROM segments WHERE release_id = ? AND segment_number = ?",
        )
        .bind(release_id)
        .bind(i64::from(segment_number))
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_failed("Failed to read segment size"))?;

        let Some(old) = old else {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "segment {} of {}",
                segment_number, release_id
            ))));
        };

        sqlx::query("UPDATE segments SET size_bytes = ? WHERE release_id = ? AND segment_number = ?")
            .bind(size_bytes as i64)
            .bind(release_id)
            .bind(i64::from(segment_number))
            .execute(&mut *tx)
            .await
            .map_err(query_failed("Failed to update segment size"))?;

        let counters = load_counters(&mut *tx, release_id).await?;
        store_counters(
            &mut *tx,
            release_id,
            counters.with_resized(old as u64, size_bytes),
            now,
        )
        .await?;

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit segment size"))?;
        Ok(())
    }

    /// Record that the peer was asked for a segment's size and did not know it
    ///
    /// Reconciliation stops looking such segments up until a size arrives.
    pub async fn mark_size_checked(&self, release_id: &ReleaseId, segment_number: u32) -> Result<()> {
        sqlx::query(
            "UPDATE segments SET size_checked = 1 WHERE release_id = ? AND segment_number = ? AND size_bytes = 0",
        )
        .bind(release_id)
        .bind(i64::from(segment_number))
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to mark segment size checked"))?;
        Ok(())
    }

    /// Segments of a release, ordered by segment number
    pub async fn get_segments(&self, release_id: &ReleaseId) -> Result<Vec<Segment>> {
        sqlx::query_as::<_, Segment>(
            "SELECT * FROM segments WHERE release_id = ? ORDER BY segment_number",
        )
        .bind(release_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to get segments"))
    }

    /// Recompute a release's counters from the segments on file
    pub async fn recompute_release_counters(
        &self,
        release_id: &ReleaseId,
    ) -> Result<ReleaseCounters> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin transaction"))?;

        let now = Utc::now().timestamp();
        lock_release(&mut *tx, release_id, now).await?;

        let sizes: Vec<i64> =
            sqlx::query_scalar("SELECT size_bytes FROM segments WHERE release_id = ?")
                .bind(release_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(query_failed("Failed to read segment sizes"))?;

        let counters = ReleaseCounters::from_segments(sizes.into_iter().map(|s| s as u64));
        store_counters(&mut *tx, release_id, counters, now).await?;

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit counter recompute"))?;
        Ok(counters)
    }

    /// Persist one ingest batch: releases, segments and the group cursor
    ///
    /// All writes land in one transaction. If anything fails nothing is
    /// written and the cursor stays where it was.
    pub async fn persist_batch(&self, batch: &BatchWrite) -> Result<BatchOutcome> {
        let now = Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin transaction"))?;

        for release in &batch.releases {
            super::releases::upsert_release(&mut *tx, release, now).await?;
        }

        let mut outcome = BatchOutcome::default();
        for segment in &batch.segments {
            match insert_segment(&mut *tx, segment, now).await? {
                SegmentChange::Inserted => {
                    outcome.inserted += 1;
                    if !outcome.changed.contains(&segment.release_id) {
                        outcome.changed.push(segment.release_id.clone());
                    }
                }
                _ => outcome.duplicates += 1,
            }
        }

        super::cursors::advance_cursor(&mut *tx, &batch.group, batch.last_article, now).await?;

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit batch"))?;
        Ok(outcome)
    }
}

async fn insert_segment(
    conn: &mut SqliteConnection,
    segment: &NewSegment,
    now: i64,
) -> Result<SegmentChange> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO segments (
            release_id, segment_number, message_id, group_name, size_bytes, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&segment.release_id)
    .bind(i64::from(segment.segment_number))
    .bind(&segment.message_id)
    .bind(&segment.group_name)
    .bind(segment.size_bytes as i64)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(query_failed("Failed to insert segment"))?;

    if result.rows_affected() == 0 {
        return Ok(SegmentChange::Duplicate);
    }

    let counters = load_counters(conn, &segment.release_id).await?;
    store_counters(
        conn,
        &segment.release_id,
        counters.with_added(segment.size_bytes),
        now,
    )
    .await?;

    Ok(SegmentChange::Inserted)
}

/// Touch the release row so the write lock covers the reads that follow
async fn lock_release(conn: &mut SqliteConnection, release_id: &ReleaseId, now: i64) -> Result<()> {
    let touched = sqlx::query("UPDATE releases SET updated_at = ? WHERE release_id = ?")
        .bind(now)
        .bind(release_id)
        .execute(&mut *conn)
        .await
        .map_err(query_failed("Failed to lock release"))?;
    if touched.rows_affected() == 0 {
        return Err(Error::Database(DatabaseError::NotFound(release_id.to_string())));
    }
    Ok(())
}

async fn load_counters(
    conn: &mut SqliteConnection,
    release_id: &ReleaseId,
) -> Result<ReleaseCounters> {
    let row: Option<(i64, i64, bool)> = sqlx::query_as(
        "SELECT part_count, size_bytes, has_parts FROM releases WHERE release_id = ?",
    )
    .bind(release_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(query_failed("Failed to read release counters"))?;

    let (part_count, size_bytes, has_parts) =
        row.ok_or_else(|| Error::Database(DatabaseError::NotFound(release_id.to_string())))?;

    Ok(ReleaseCounters {
        part_count: part_count as u32,
        size_bytes: size_bytes as u64,
        has_parts,
    })
}

async fn store_counters(
    conn: &mut SqliteConnection,
    release_id: &ReleaseId,
    counters: ReleaseCounters,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE releases
        SET part_count = ?, size_bytes = ?, has_parts = ?, updated_at = ?
        WHERE release_id = ?
        "#,
    )
    .bind(i64::from(counters.part_count))
    .bind(counters.size_bytes as i64)
    .bind(counters.has_parts)
    .bind(now)
    .bind(release_id)
    .execute(&mut *conn)
    .await
    .map_err(query_failed("Failed to write release counters"))?;

    Ok(())
}
