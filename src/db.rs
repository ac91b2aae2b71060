use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Pool;
use sqlx::Postgres;
use sqlx::Row;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::instrument;
use tracing::warn;

use crate::models::CompletedRecord;
use crate::models::PendingRecord;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Local queue of records whose Notion write failed.
///
/// `due` hands out the least-tried records first and skips records that are
/// waiting out a backoff or have been parked, so a few bad rows never starve
/// the rest of the queue.
#[async_trait]
pub trait Outbox: Send + Sync {
  async fn enqueue(&self, record: &CompletedRecord, reason: &str) -> Result<i64>;
  async fn due(&self, limit: i64) -> Result<Vec<PendingRecord>>;
  async fn mark_synced(&self, id: i64) -> Result<()>;
  async fn mark_failed(&self, id: i64, reason: &str, retry_at: DateTime<Utc>) -> Result<()>;
  /// Stops retrying a record; it stays in the table for inspection.
  async fn park(&self, id: i64, reason: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Db {
  pool: Pool<Postgres>,
}

impl Db {
  pub async fn connect(database_url: &str) -> Result<Self> {
    let pool = PgPoolOptions::new().max_connections(5).connect(database_url).await?;
    MIGRATOR.run(&pool).await?;
    Ok(Self { pool })
  }
}

#[async_trait]
impl Outbox for Db {
  #[instrument(skip(self, record), fields(user_id = record.submitter.user_id))]
  async fn enqueue(&self, record: &CompletedRecord, reason: &str) -> Result<i64> {
    let payload = serde_json::to_string(record).context("failed to serialize record")?;
    let row = sqlx::query(
      r#"
      INSERT INTO pending_records (user_id, record, last_error)
      VALUES ($1, $2, $3)
      RETURNING id
      "#,
    )
    .bind(record.submitter.user_id)
    .bind(payload)
    .bind(reason)
    .fetch_one(&self.pool)
    .await?;
    Ok(row.try_get("id")?)
  }

  #[instrument(skip(self))]
  async fn due(&self, limit: i64) -> Result<Vec<PendingRecord>> {
    let rows = sqlx::query(
      r#"
      SELECT id, record, attempts
      FROM pending_records
      WHERE synced_at IS NULL
        AND parked_at IS NULL
        AND next_attempt_at <= NOW()
      ORDER BY attempts, id
      LIMIT $1
      "#,
    )
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    let mut pending = Vec::with_capacity(rows.len());
    for row in rows {
      let id: i64 = row.try_get("id")?;
      let raw: String = row.try_get("record")?;
      match serde_json::from_str::<CompletedRecord>(&raw) {
        Ok(record) => pending.push(PendingRecord {
          id,
          record,
          attempts: row.try_get("attempts")?,
        }),
        Err(err) => {
          warn!(error = %err, id, "parking unreadable pending record");
          self.park(id, &format!("unreadable record: {err}")).await?;
        },
      }
    }
    Ok(pending)
  }

  #[instrument(skip(self))]
  async fn mark_synced(&self, id: i64) -> Result<()> {
    sqlx::query("UPDATE pending_records SET synced_at = NOW(), attempts = attempts + 1 WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  async fn mark_failed(&self, id: i64, reason: &str, retry_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
      r#"
      UPDATE pending_records
      SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
      WHERE id = $1
      "#,
    )
    .bind(id)
    .bind(reason)
    .bind(retry_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  async fn park(&self, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
      "UPDATE pending_records SET attempts = attempts + 1, last_error = $2, parked_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(reason)
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}
