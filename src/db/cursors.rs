//! Per-group ingest cursors.
//!
//! A cursor is the highest article number durably processed for a group. It
//! only ever moves forward.

use crate::Result;
use chrono::Utc;
use sqlx::SqliteConnection;

use super::{Cursor, Database, query_failed};

impl Database {
    /// Last processed article number for `group`, if any
    pub async fn get_cursor(&self, group: &str) -> Result<Option<u64>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_article_number FROM cursors WHERE group_name = ?")
                .bind(group)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_failed("Failed to get cursor"))?;

        Ok(value.map(|n| n as u64))
    }

    /// Move the cursor for `group` forward to `article_number`
    ///
    /// A lower value than the stored one is ignored.
    pub async fn advance_cursor(&self, group: &str, article_number: u64) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(query_failed("Failed to acquire connection"))?;
        advance_cursor(&mut *conn, group, article_number, Utc::now().timestamp()).await
    }

    /// All cursors, ordered by group name
    pub async fn list_cursors(&self) -> Result<Vec<Cursor>> {
        sqlx::query_as::<_, Cursor>("SELECT * FROM cursors ORDER BY group_name")
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("Failed to list cursors"))
    }
}

/// Forward-only cursor upsert inside the caller's transaction
pub(super) async fn advance_cursor(
    conn: &mut SqliteConnection,
    group: &str,
    article_number: u64,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cursors (group_name, last_article_number, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(group_name) DO UPDATE SET
            last_article_number = MAX(cursors.last_article_number, excluded.last_article_number),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(group)
    .bind(article_number as i64)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(query_failed("Failed to advance cursor"))?;

    Ok(())
}
