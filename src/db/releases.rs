//! Release records: upsert, lookup, availability, pruning.

use crate::types::ReleaseId;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{Database, NewRelease, Release, query_failed};

impl Database {
    /// Create a release, or widen an existing one's article window
    ///
    /// Category, source group and language are fixed when the release is
    /// first created.
    pub async fn upsert_release(&self, release: &NewRelease) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(query_failed("Failed to acquire connection"))?;
        upsert_release(&mut *conn, release, Utc::now().timestamp()).await
    }

    /// Get a release by id
    pub async fn get_release(&self, release_id: &ReleaseId) -> Result<Option<Release>> {
        sqlx::query_as::<_, Release>("SELECT * FROM releases WHERE release_id = ?")
            .bind(release_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to get release"))
    }

    /// Releases whose stored counters disagree with their segments
    ///
    /// Keyset-paginated on `release_id`: pass the last id of the previous page
    /// as `after`.
    pub async fn list_releases_needing_reconciliation(
        &self,
        limit: u32,
        after: Option<&ReleaseId>,
    ) -> Result<Vec<Release>> {
        sqlx::query_as::<_, Release>(
            r#"
            SELECT r.* FROM releases r
            LEFT JOIN (
                SELECT release_id,
                       COUNT(*) AS actual_parts,
                       SUM(size_bytes) AS actual_size,
                       SUM(size_bytes = 0 AND size_checked = 0) AS unknown_sizes
                FROM segments
                GROUP BY release_id
            ) s ON s.release_id = r.release_id
            WHERE r.release_id > ?
              AND r.taken_down = 0
              AND (
                    r.available = 0
                 OR s.release_id IS NULL
                 OR r.part_count != s.actual_parts
                 OR r.size_bytes != s.actual_size
                 OR r.has_parts != (r.part_count > 0)
                 OR s.unknown_sizes > 0
              )
            ORDER BY r.release_id
            LIMIT ?
            "#,
        )
        .bind(after.map(ReleaseId::as_str).unwrap_or(""))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list releases needing reconciliation"))
    }

    /// Flag a release unavailable (keeps the first `unavailable_since`)
    pub async fn mark_unavailable(&self, release_id: &ReleaseId) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE releases
            SET available = 0,
                unavailable_since = COALESCE(unavailable_since, ?),
                updated_at = ?
            WHERE release_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(release_id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to mark release unavailable"))?;

        Ok(())
    }

    /// Flag a release unavailable and exempt it from reconciliation
    ///
    /// Returns whether the release exists.
    pub async fn take_down(&self, release_id: &ReleaseId) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE releases
            SET available = 0,
                taken_down = 1,
                unavailable_since = COALESCE(unavailable_since, ?),
                updated_at = ?
            WHERE release_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(release_id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to take down release"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Clear the unavailable flag
    pub async fn mark_available(&self, release_id: &ReleaseId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE releases
            SET available = 1, unavailable_since = NULL, updated_at = ?
            WHERE release_id = ? AND taken_down = 0
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(release_id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to mark release available"))?;

        Ok(())
    }

    /// Delete a release and (by cascade) its segments
    ///
    /// Returns whether a row was deleted.
    pub async fn delete_release(&self, release_id: &ReleaseId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM releases WHERE release_id = ?")
            .bind(release_id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to delete release"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Unavailable releases posted before `cutoff`
    pub async fn list_stale_unavailable(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ReleaseId>> {
        sqlx::query_scalar(
            r#"
            SELECT release_id FROM releases
            WHERE available = 0 AND taken_down = 0 AND posted_at < ?
            ORDER BY posted_at
            LIMIT ?
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list stale releases"))
    }

    /// Every group that has a cursor or owns a release
    pub async fn list_known_groups(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT group_name FROM cursors
            UNION
            SELECT DISTINCT source_group FROM releases
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list known groups"))
    }

    /// Delete every release sourced from `group` together with its cursor
    ///
    /// Returns the ids of the deleted releases.
    pub async fn delete_group(&self, group: &str) -> Result<Vec<ReleaseId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin transaction"))?;

        let ids: Vec<ReleaseId> =
            sqlx::query_scalar("DELETE FROM releases WHERE source_group = ? RETURNING release_id")
                .bind(group)
                .fetch_all(&mut *tx)
                .await
                .map_err(query_failed("Failed to delete group releases"))?;

        sqlx::query("DELETE FROM cursors WHERE group_name = ?")
            .bind(group)
            .execute(&mut *tx)
            .await
            .map_err(query_failed("Failed to delete group cursor"))?;

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit group deletion"))?;

        Ok(ids)
    }
}

/// Insert a release or widen its article window, inside the caller's transaction
pub(super) async fn upsert_release(
    conn: &mut SqliteConnection,
    release: &NewRelease,
    now: i64,
) -> Result<()> {
    let posted_date = release
        .release_id
        .posted_date()
        .unwrap_or_else(|| release.posted_at.date_naive())
        .format("%Y-%m-%d")
        .to_string();

    sqlx::query(
        r#"
        INSERT INTO releases (
            release_id, canonical_title, category_id, source_group, posted_at, posted_date,
            expected_parts, language, tags, article_low, article_high, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(release_id) DO UPDATE SET
            posted_at = MIN(releases.posted_at, excluded.posted_at),
            expected_parts = MAX(releases.expected_parts, excluded.expected_parts),
            tags = CASE WHEN releases.tags = '' THEN excluded.tags ELSE releases.tags END,
            article_low = CASE WHEN releases.source_group = excluded.source_group
                THEN MIN(releases.article_low, excluded.article_low)
                ELSE releases.article_low END,
            article_high = CASE WHEN releases.source_group = excluded.source_group
                THEN MAX(releases.article_high, excluded.article_high)
                ELSE releases.article_high END,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&release.release_id)
    .bind(&release.canonical_title)
    .bind(i64::from(release.category_id))
    .bind(&release.source_group)
    .bind(release.posted_at.timestamp())
    .bind(posted_date)
    .bind(i64::from(release.expected_parts))
    .bind(&release.language)
    .bind(release.tags.join(" "))
    .bind(release.article_low as i64)
    .bind(release.article_high as i64)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(query_failed("Failed to upsert release"))?;

    Ok(())
}
