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

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use shardkeep_base::readable_size::ReadableSize;

use crate::{
    config::StoreConfig,
    err::{CorruptStoreSnafu, IoSnafu, Result},
    types::{ByteRange, CompletedPart, PartId, PlanRecord},
};

/// Table definitions. Column names are part of the on-disk contract.
const SCHEMA: &[&str] = &[
    r"CREATE TABLE OriginalFile(
        file_identity TEXT NOT NULL,
        part_count INTEGER NOT NULL,
        segment_size INTEGER NOT NULL CHECK (segment_size > 0)
    )",
    r#"CREATE TABLE Part(
        part_id INTEGER PRIMARY KEY NOT NULL,
        start INTEGER NOT NULL,
        "end" INTEGER NOT NULL,
        CHECK (0 <= start AND start < "end")
    )"#,
    r"CREATE TABLE Checksum(
        part_id INTEGER NOT NULL UNIQUE REFERENCES Part(part_id),
        hash TEXT NOT NULL
    )",
    r"CREATE TABLE OutputFile(
        part_id INTEGER NOT NULL UNIQUE REFERENCES Part(part_id),
        path TEXT NOT NULL
    )",
];

/// Suffix of the scratch file a new store is built in before it is moved
/// into place.
const STAGING_SUFFIX: &str = "creating";

pub(crate) async fn connect(
    path: &Path,
    create_if_missing: bool,
    config: &StoreConfig,
) -> Result<SqlitePool> {
    // Rollback journal keeps the store a single file, so it can be replaced
    // with one rename.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create_if_missing)
        .journal_mode(SqliteJournalMode::Delete)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn to_u64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        CorruptStoreSnafu {
            message: format!("{what} is negative: {value}"),
        }
        .build()
    })
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        CorruptStoreSnafu {
            message: format!("{what} does not fit in a SQLite integer: {value}"),
        }
        .build()
    })
}

fn path_to_text(path: &Path) -> String { path.to_string_lossy().into_owned() }

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context(IoSnafu { path }),
        _ => Ok(()),
    }
}

/// Durable record of one job: the partition plan plus per-part completion
/// facts.
///
/// Every method runs either a single statement or one short transaction, so
/// a crash never leaves a half-applied mutation behind.
pub struct JobStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl JobStore {
    /// Record a new plan at `path`.
    ///
    /// The schema and all rows are written inside one transaction into a
    /// staging file that is renamed over `path` only after commit. A crash
    /// at any point leaves either no store at `path` or a complete one.
    #[tracing::instrument(level = "debug", skip(ranges, config), fields(parts = ranges.len()), err)]
    pub async fn create(
        path: &Path,
        file_identity: &str,
        segment_size: ReadableSize,
        ranges: &[ByteRange],
        config: &StoreConfig,
    ) -> Result<Self> {
        let mut staging = path.as_os_str().to_owned();
        staging.push(format!(".{STAGING_SUFFIX}"));
        let staging = PathBuf::from(staging);
        remove_if_exists(&staging).await?;

        let pool = connect(&staging, true, config).await?;
        let mut tx = pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        sqlx::query(
            "INSERT INTO OriginalFile (file_identity, part_count, segment_size) VALUES (?, ?, ?)",
        )
        .bind(file_identity)
        .bind(to_i64(ranges.len() as u64, "part_count")?)
        .bind(to_i64(segment_size.as_bytes(), "segment_size")?)
        .execute(&mut *tx)
        .await?;

        for (index, range) in ranges.iter().enumerate() {
            sqlx::query(r#"INSERT INTO Part (part_id, start, "end") VALUES (?, ?, ?)"#)
                .bind(PartId::from_index(index))
                .bind(to_i64(range.start, "part start")?)
                .bind(to_i64(range.end, "part end")?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        pool.close().await;

        tokio::fs::rename(&staging, path)
            .await
            .context(IoSnafu { path })?;

        tracing::debug!("Created job store at {}", path.display());
        Self::open(path, config).await
    }

    /// Attach to an existing store without modifying it.
    #[tracing::instrument(level = "debug", skip(config), err)]
    pub async fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let pool = connect(path, false, config).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Release every pooled connection.
    pub async fn close(self) { self.pool.close().await; }

    /// Close the store and delete its file.
    pub async fn destroy(self) -> Result<()> {
        let path = self.path.clone();
        self.close().await;
        remove_if_exists(&path).await
    }

    /// Facts recorded when the plan was made, or `None` if the store holds
    /// no plan.
    pub async fn original_file(&self) -> Result<Option<PlanRecord>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT file_identity, part_count, segment_size FROM OriginalFile LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(file_identity, count, segment_size)| -> Result<PlanRecord> {
            let part_count = usize::try_from(to_u64(count, "part_count")?).map_err(|_| {
                CorruptStoreSnafu {
                    message: format!("part_count {count} is too large"),
                }
                .build()
            })?;
            Ok(PlanRecord {
                file_identity,
                part_count,
                segment_size: ReadableSize(to_u64(segment_size, "segment_size")?),
            })
        })
        .transpose()
    }

    pub async fn part_count(&self) -> Result<Option<usize>> {
        Ok(self.original_file().await?.map(|plan| plan.part_count))
    }

    pub async fn lookup_range(&self, part_id: PartId) -> Result<Option<ByteRange>> {
        let row: Option<(i64, i64)> =
            sqlx::query_as(r#"SELECT start, "end" FROM Part WHERE part_id = ?"#)
                .bind(part_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(start, end)| -> Result<ByteRange> {
            Ok(ByteRange::new(
                to_u64(start, "part start")?,
                to_u64(end, "part end")?,
            ))
        })
        .transpose()
    }

    /// Every part with its range, in id order.
    pub async fn parts(&self) -> Result<Vec<(PartId, ByteRange)>> {
        let rows: Vec<(PartId, i64, i64)> =
            sqlx::query_as(r#"SELECT part_id, start, "end" FROM Part ORDER BY part_id"#)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, start, end)| -> Result<(PartId, ByteRange)> {
                Ok((
                    id,
                    ByteRange::new(to_u64(start, "part start")?, to_u64(end, "part end")?),
                ))
            })
            .collect()
    }

    /// Parts lacking either a checksum or an output record, ascending.
    ///
    /// A part with only one of the two is treated as not done.
    pub async fn pending_part_ids(&self) -> Result<Vec<PartId>> {
        let rows: Vec<(PartId,)> = sqlx::query_as(
            r"SELECT p.part_id FROM Part p
              WHERE NOT EXISTS (SELECT 1 FROM Checksum c WHERE c.part_id = p.part_id)
                 OR NOT EXISTS (SELECT 1 FROM OutputFile o WHERE o.part_id = p.part_id)
              ORDER BY p.part_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Parts with both records, ascending.
    pub async fn completed_parts(&self) -> Result<Vec<CompletedPart>> {
        let rows: Vec<(PartId, String, String)> = sqlx::query_as(
            r"SELECT p.part_id, c.hash, o.path FROM Part p
              JOIN Checksum c ON c.part_id = p.part_id
              JOIN OutputFile o ON o.part_id = p.part_id
              ORDER BY p.part_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(part_id, token, path)| CompletedPart {
                part_id,
                token,
                path: PathBuf::from(path),
            })
            .collect())
    }

    pub async fn has_any_output(&self) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM OutputFile)")
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Every recorded output path, including those of inconsistent parts.
    pub async fn output_paths(&self) -> Result<Vec<(PartId, PathBuf)>> {
        let rows: Vec<(PartId, String)> =
            sqlx::query_as("SELECT part_id, path FROM OutputFile ORDER BY part_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, path)| (id, PathBuf::from(path)))
            .collect())
    }

    /// Output path recorded for one part, if any.
    pub async fn output_path(&self, part_id: PartId) -> Result<Option<PathBuf>> {
        let path: Option<String> = sqlx::query_scalar("SELECT path FROM OutputFile WHERE part_id = ?")
            .bind(part_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(path.map(PathBuf::from))
    }

    /// Upsert the checksum and output records of one part together.
    ///
    /// Repeating the call for the same part replaces the previous values
    /// rather than adding rows.
    pub async fn record_completion(&self, part_id: PartId, token: &str, path: &Path) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO Checksum (part_id, hash) VALUES (?, ?)
             ON CONFLICT(part_id) DO UPDATE SET hash = excluded.hash",
        )
        .bind(part_id)
        .bind(token)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO OutputFile (part_id, path) VALUES (?, ?)
             ON CONFLICT(part_id) DO UPDATE SET path = excluded.path",
        )
        .bind(part_id)
        .bind(path_to_text(path))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop all completion facts; the plan itself is untouched.
    pub async fn clear_completions(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM Checksum").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM OutputFile").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Forget one part's completion, e.g. after it failed verification.
    pub async fn clear_completion(&self, part_id: PartId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM Checksum WHERE part_id = ?")
            .bind(part_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM OutputFile WHERE part_id = ?")
            .bind(part_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) const fn pool(&self) -> &SqlitePool { &self.pool }
}
