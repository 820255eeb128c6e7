// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use jiff::{SignedDuration, Timestamp};
use snafu::ResultExt;
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    config::StoreConfig,
    err::{IoSnafu, Result, TimestampSnafu},
    store::connect,
};

/// File name of the history store under the workspace root.
pub const HISTORY_FILE_NAME: &str = "history.db";

/// Minimum spacing between two recorded runs.
pub const RUN_INTERVAL: SignedDuration = SignedDuration::from_hours(24);

/// Remembers when a job last ran to completion, across all targets.
pub struct HistoryStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl HistoryStore {
    /// Open (or create) `<root>/history.db`.
    #[tracing::instrument(level = "debug", skip(config), err)]
    pub async fn open(root: &Path, config: &StoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .context(IoSnafu { path: root })?;
        let path = root.join(HISTORY_FILE_NAME);
        let pool = connect(&path, true, config).await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS lastrun(completed_time INTEGER NOT NULL)")
            .execute(&pool)
            .await?;
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// When a run was last recorded, if ever.
    pub async fn last_run(&self) -> Result<Option<Timestamp>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT completed_time FROM lastrun LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(seconds,)| Timestamp::from_second(seconds).context(TimestampSnafu))
            .transpose()
    }

    /// Record that a run finished now.
    ///
    /// Returns `true` when the timestamp was written and `false` when the
    /// previous run is less than [`RUN_INTERVAL`] old, in which case nothing
    /// changes.
    pub async fn record_run_completion(&self) -> Result<bool> {
        self.record_run_completion_at(Timestamp::now()).await
    }

    /// Like [`Self::record_run_completion`] with an explicit clock.
    ///
    /// The check and the write run under one `BEGIN IMMEDIATE` transaction,
    /// so concurrent callers on the same history file record at most once.
    pub async fn record_run_completion_at(&self, now: Timestamp) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        match record_locked(&mut conn, now).await {
            Ok(recorded) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(recorded)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(error = %rollback, "Failed to roll back history update");
                }
                Err(e)
            }
        }
    }

    pub async fn close(self) { self.pool.close().await; }
}

/// Check-and-write of the run timestamp; the caller holds the write lock.
async fn record_locked(conn: &mut SqliteConnection, now: Timestamp) -> Result<bool> {
    let seconds = now.as_second();
    let last: Option<i64> = sqlx::query_scalar("SELECT completed_time FROM lastrun LIMIT 1")
        .fetch_optional(&mut *conn)
        .await?;
    let last = last
        .map(|stored| Timestamp::from_second(stored).context(TimestampSnafu))
        .transpose()?;

    match last {
        None => {
            sqlx::query("INSERT INTO lastrun (completed_time) VALUES (?)")
                .bind(seconds)
                .execute(&mut *conn)
                .await?;
            tracing::info!("Recorded first run at {now}");
            Ok(true)
        }
        Some(last) if now.duration_since(last) > RUN_INTERVAL => {
            sqlx::query("UPDATE lastrun SET completed_time = ?")
                .bind(seconds)
                .execute(&mut *conn)
                .await?;
            tracing::info!("Recorded run at {now}, previous was {last}");
            Ok(true)
        }
        Some(last) => {
            tracing::debug!("Last run at {last} is within {RUN_INTERVAL:?}, not recording");
            Ok(false)
        }
    }
}
