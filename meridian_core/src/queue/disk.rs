use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use super::traits::Queue;
use crate::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  payload      BLOB NOT NULL,
  status       INTEGER NOT NULL DEFAULT 0,
  expired_date TEXT NULL
);
CREATE INDEX IF NOT EXISTS queue_status_id_idx ON queue(status, id);
"#;

/// Durable FIFO over one SQLite file per logical queue name.
///
/// Rows move `status=0` (pending) -> `status=1` (claimed, with a visibility
/// deadline) -> deleted on commit. `get` first resets claimed rows whose
/// deadline expired (items abandoned by crashed workers), then claims the
/// oldest pending row with a single atomic statement so two workers can never
/// claim the same row.
pub struct DiskQueue<T> {
    pool: SqlitePool,
    poll_interval: Duration,
    claim_visibility: Duration,
    claimed: Mutex<VecDeque<i64>>,
    _payload: PhantomData<fn() -> T>,
}

/// Reduce a logical queue name to a filesystem-safe token.
pub fn sanitize_queue_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl<T> DiskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn open(
        dir: impl AsRef<Path>,
        name: &str,
        pool_connections: u32,
        poll_interval: Duration,
        claim_visibility: Duration,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::backend("disk_queue mkdir", e))?;
        let path = dir.join(format!("{}.db", sanitize_queue_name(name)));

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("disk_queue connect options", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        // Pool sized to the worker count so concurrent claims don't serialize
        // behind a single writer connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_connections)
            .connect_with(opts)
            .await?;

        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            poll_interval,
            claim_visibility,
            claimed: Mutex::new(VecDeque::new()),
            _payload: PhantomData,
        })
    }

    async fn recover_expired(&self) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE queue SET status = 0, expired_date = NULL \
             WHERE status = 1 AND expired_date <= ?1",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            tracing::warn!(
                recovered = res.rows_affected(),
                "recovered claimed rows abandoned past their visibility deadline"
            );
        }
        Ok(res.rows_affected())
    }

    /// Claim-and-mark in one statement; the subselect picks the oldest
    /// pending row by insertion order.
    async fn try_claim(&self) -> Result<Option<(i64, T)>> {
        let deadline = Utc::now()
            + ChronoDuration::from_std(self.claim_visibility)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let row = sqlx::query(
            "UPDATE queue SET status = 1, expired_date = ?1 \
             WHERE id = (SELECT id FROM queue WHERE status = 0 ORDER BY id LIMIT 1) \
             RETURNING id, payload",
        )
        .bind(deadline.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let payload: Vec<u8> = row.get("payload");
        let item = serde_json::from_slice(&payload)
            .map_err(|e| Error::backend("disk_queue decode payload", e))?;
        Ok(Some((id, item)))
    }
}

#[async_trait]
impl<T> Queue<T> for DiskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn put(&self, item: T) -> Result<()> {
        let payload =
            serde_json::to_vec(&item).map_err(|e| Error::backend("disk_queue encode payload", e))?;
        sqlx::query("INSERT INTO queue (payload, status) VALUES (?1, 0)")
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self) -> Result<T> {
        loop {
            self.recover_expired().await?;
            if let Some((id, item)) = self.try_claim().await? {
                self.claimed.lock().await.push_back(id);
                return Ok(item);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn commit(&self) -> Result<()> {
        let id = self.claimed.lock().await.pop_front();
        let Some(id) = id else {
            return Err(Error::message("commit without an uncommitted claim"));
        };
        sqlx::query("DELETE FROM queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn size(&self) -> usize {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE status = 0")
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0);
        count.max(0) as usize
    }

    async fn teardown(&self) -> Result<()> {
        loop {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue")
                .fetch_one(&self.pool)
                .await?;
            if count == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
