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
    sync::Arc,
};

use shardkeep_base::readable_size::ReadableSize;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufReader, BufWriter},
};
use tracing::{debug, info, warn};

use crate::{
    checksum::part_token,
    config::{JobConfig, StoreConfig},
    err::{
        BlockedOnExistingOutputSnafu, CorruptStoreSnafu, FinalOutputMissingSnafu, IoSnafu,
        JobNotFoundSnafu, JoinSnafu, NotVerifiedSnafu, PartNotFoundSnafu, PartTooLargeSnafu,
        ReadPartSnafu, Result,
    },
    partition::partition,
    store::{JobStore, remove_if_exists},
    types::{ByteRange, CompletedPart, JobStatus, OpenedAs, PartId, PlanRecord, Verification},
    workspace::WorkspaceLayout,
};

/// Owns one job: the target file handle, its workspace and its store.
///
/// Every store mutation is committed before the call returns, so a process
/// killed at any point can reopen the same target and pick up where it left
/// off.
pub struct JobController {
    config:       JobConfig,
    layout:       WorkspaceLayout,
    store:        JobStore,
    target:       Arc<std::fs::File>,
    target_path:  PathBuf,
    total_length: u64,
    segment_size: ReadableSize,
    opened_as:    OpenedAs,
    is_resuming:  bool,
    blocked_on:   Option<PathBuf>,
}

impl JobController {
    /// Open the job for `target`, creating, resuming or replacing its store.
    ///
    /// An existing store keeps the segment size it was planned with, even
    /// when `config` asks for another one. Only a store that cannot be read,
    /// or whose plan no longer fits the target, is thrown away along with
    /// its completion records.
    pub async fn open(config: JobConfig, target: &Path) -> Result<Self> {
        Self::open_with(config, target, Attach::CreateOrReplace).await
    }

    /// Open a job that has already been planned, without creating,
    /// replacing or deleting anything.
    ///
    /// Fails with [`crate::Error::JobNotFound`] when no store exists and with
    /// [`crate::Error::CorruptStore`] when the store does not fit the target.
    pub async fn open_existing(config: JobConfig, target: &Path) -> Result<Self> {
        Self::open_with(config, target, Attach::ExistingOnly).await
    }

    #[tracing::instrument(level = "info", skip(config), fields(root = %config.workspace_root.display()), err)]
    async fn open_with(config: JobConfig, target: &Path, mode: Attach) -> Result<Self> {
        let file = File::open(target)
            .await
            .context(IoSnafu { path: target })?;
        let total_length = file
            .metadata()
            .await
            .context(IoSnafu { path: target })?
            .len();

        let layout =
            WorkspaceLayout::new(&config.workspace_root, target, &config.output_extension).await?;
        if mode == Attach::CreateOrReplace {
            layout.ensure_exists().await?;
        }

        let Attached {
            store,
            opened_as,
            segment_size,
        } = attach_store(&layout, total_length, config.segment_size, &config.store, mode).await?;
        let is_resuming = opened_as == OpenedAs::Resumed && store.has_any_output().await?;

        let final_path = layout.final_output_path();
        let final_exists = tokio::fs::try_exists(&final_path)
            .await
            .context(IoSnafu { path: &final_path })?;
        let blocked_on = match (final_exists, opened_as) {
            (false, _) => None,
            (true, OpenedAs::Replaced) => {
                remove_if_exists(&final_path).await?;
                info!("Removed final output left by the replaced job: {}", final_path.display());
                None
            }
            (true, _) => {
                warn!(
                    "Final output {} already exists; waiting for consent to discard it",
                    final_path.display()
                );
                Some(final_path)
            }
        };

        info!(
            identity = %layout.identity(),
            %segment_size,
            opened_as = %opened_as,
            is_resuming,
            "Opened job"
        );

        Ok(Self {
            config,
            layout,
            store,
            target: Arc::new(file.into_std().await),
            target_path: target.to_path_buf(),
            total_length,
            segment_size,
            opened_as,
            is_resuming,
            blocked_on,
        })
    }

    pub const fn opened_as(&self) -> OpenedAs { self.opened_as }

    /// Whether opening discarded a stale store.
    pub fn reset_occurred(&self) -> bool { self.opened_as == OpenedAs::Replaced }

    /// Whether the store was resumed with at least one output already recorded.
    pub const fn is_resuming(&self) -> bool { self.is_resuming }

    /// Final output that must be discarded before progress can be recorded.
    pub fn blocked_on(&self) -> Option<&Path> { self.blocked_on.as_deref() }

    pub const fn is_blocked(&self) -> bool { self.blocked_on.is_some() }

    pub const fn layout(&self) -> &WorkspaceLayout { &self.layout }

    pub const fn config(&self) -> &JobConfig { &self.config }

    pub fn target_path(&self) -> &Path { &self.target_path }

    pub const fn total_length(&self) -> u64 { self.total_length }

    /// Segment size the plan was made with; may differ from the configured one.
    pub const fn segment_size(&self) -> ReadableSize { self.segment_size }

    /// Delete a pre-existing final output and lift the block it caused.
    pub async fn discard_existing_output(&mut self) -> Result<()> {
        if let Some(path) = self.blocked_on.take() {
            remove_if_exists(&path).await?;
            info!("Discarded existing final output {}", path.display());
        }
        Ok(())
    }

    fn ensure_unblocked(&self) -> Result<()> {
        match &self.blocked_on {
            Some(path) => BlockedOnExistingOutputSnafu { path: path.clone() }.fail(),
            None => Ok(()),
        }
    }

    /// The byte range of `part_id`.
    pub async fn lookup_range(&self, part_id: PartId) -> Result<ByteRange> {
        self.store
            .lookup_range(part_id)
            .await?
            .context(PartNotFoundSnafu { part_id })
    }

    /// Every part of the plan in id order.
    pub async fn parts(&self) -> Result<Vec<(PartId, ByteRange)>> { self.store.parts().await }

    /// Read the bytes of `part_id` from the target.
    ///
    /// Reads are positioned, so any number of them may run at once.
    pub async fn read_part_bytes(&self, part_id: PartId) -> Result<Vec<u8>> {
        let range = self.lookup_range(part_id).await?;
        let len = usize::try_from(range.len()).ok().context(PartTooLargeSnafu {
            part_id,
            len: range.len(),
        })?;

        let file = Arc::clone(&self.target);
        let path = self.target_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            read_exact_at(&file, &mut buf, range.start).context(ReadPartSnafu { part_id, path })?;
            Ok(buf)
        })
        .await
        .context(JoinSnafu)?
    }

    /// Parts still waiting for a recorded output, ascending.
    pub async fn pending_part_ids(&self) -> Result<Vec<PartId>> {
        self.store.pending_part_ids().await
    }

    /// Record that `part_id` was processed into `path` with integrity `token`.
    ///
    /// Recording the same part again overwrites the earlier record.
    pub async fn record_completion(&self, part_id: PartId, token: &str, path: &Path) -> Result<()> {
        self.ensure_unblocked()?;
        self.lookup_range(part_id).await?;
        self.store.record_completion(part_id, token, path).await?;
        debug!(%part_id, token, path = %path.display(), "Recorded part completion");
        Ok(())
    }

    /// Check every part output against its recorded token, in id order.
    pub async fn verify(&self) -> Result<Verification> {
        let pending = self.store.pending_part_ids().await?;
        if !pending.is_empty() {
            return Ok(Verification::Pending {
                count: pending.len(),
            });
        }

        for CompletedPart {
            part_id,
            token,
            path,
        } in self.store.completed_parts().await?
        {
            let exists = tokio::fs::try_exists(&path)
                .await
                .context(IoSnafu { path: &path })?;
            if !exists {
                return Ok(Verification::MissingOutput { part_id, path });
            }

            let actual = part_token(&path, self.config.checksum_mode).await?;
            if actual != token {
                return Ok(Verification::ChecksumMismatch {
                    part_id,
                    expected: token,
                    actual,
                });
            }
        }
        Ok(Verification::Complete)
    }

    /// Concatenate every part output, in id order, into the final output.
    ///
    /// The first part's file is extended in place and then moved to
    /// [`WorkspaceLayout::final_output_path`]. Completion records are
    /// cleared afterwards.
    #[tracing::instrument(level = "info", skip(self), err)]
    pub async fn finalize(&mut self) -> Result<PathBuf> {
        self.ensure_unblocked()?;
        let verification = self.verify().await?;
        ensure!(
            verification.is_complete(),
            NotVerifiedSnafu {
                reason: verification.to_string(),
            }
        );

        let parts = self.store.completed_parts().await?;
        let (head, tail) = parts.split_first().context(NotVerifiedSnafu {
            reason: "job has no parts",
        })?;
        append_parts(&head.path, tail).await?;

        let final_path = self.layout.final_output_path();
        tokio::fs::rename(&head.path, &final_path)
            .await
            .context(IoSnafu { path: &final_path })?;
        info!(parts = parts.len(), "Assembled {}", final_path.display());

        self.reset(true).await?;
        Ok(final_path)
    }

    /// Delete recorded part outputs and forget every completion.
    ///
    /// The final output is removed too unless `keep_final` is set. Part files
    /// that cannot be deleted are logged and skipped.
    pub async fn reset(&mut self, keep_final: bool) -> Result<()> {
        for (part_id, path) in self.store.output_paths().await? {
            remove_part_output(part_id, &path).await;
        }
        self.store.clear_completions().await?;

        if !keep_final {
            remove_if_exists(&self.layout.final_output_path()).await?;
            self.blocked_on = None;
        }
        info!(keep_final, "Reset job");
        Ok(())
    }

    /// Forget the completion of one part and delete its output, so it shows
    /// up as pending again. Other parts are untouched.
    pub async fn reset_part(&self, part_id: PartId) -> Result<()> {
        self.lookup_range(part_id).await?;
        if let Some(path) = self.store.output_path(part_id).await? {
            remove_part_output(part_id, &path).await;
        }
        self.store.clear_completion(part_id).await?;
        info!(%part_id, "Reset part");
        Ok(())
    }

    /// Size of the assembled output.
    pub async fn final_output_len(&self) -> Result<u64> {
        let path = self.layout.final_output_path();
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => FinalOutputMissingSnafu { path }.fail(),
            Err(e) => Err(e).context(IoSnafu { path }),
        }
    }

    pub async fn status(&self) -> Result<JobStatus> {
        let total = self.store.part_count().await?.unwrap_or_default();
        let pending = self.store.pending_part_ids().await?.len();
        Ok(JobStatus {
            total,
            completed: total.saturating_sub(pending),
            pending,
        })
    }

    /// Release the store connections and the target handle.
    pub async fn close(self) { self.store.close().await; }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attach {
    CreateOrReplace,
    ExistingOnly,
}

struct Attached {
    store:        JobStore,
    opened_as:    OpenedAs,
    segment_size: ReadableSize,
}

/// Whether a recorded plan still describes the target.
fn plan_fits(plan: &PlanRecord, layout: &WorkspaceLayout, total_length: u64) -> bool {
    plan.file_identity == layout.identity().as_str()
        && partition(total_length, plan.segment_size.as_bytes())
            .is_ok_and(|ranges| ranges.len() == plan.part_count)
}

async fn create_store(
    layout: &WorkspaceLayout,
    total_length: u64,
    segment_size: ReadableSize,
    config: &StoreConfig,
    opened_as: OpenedAs,
) -> Result<Attached> {
    let plan = partition(total_length, segment_size.as_bytes())?;
    let store = JobStore::create(
        &layout.store_path(),
        layout.identity().as_str(),
        segment_size,
        &plan,
        config,
    )
    .await?;
    Ok(Attached {
        store,
        opened_as,
        segment_size,
    })
}

/// Open the store at the layout's path.
///
/// A store whose plan fits the target is resumed with its recorded segment
/// size. Anything else is recreated with `requested`, unless `mode` forbids
/// touching the store.
async fn attach_store(
    layout: &WorkspaceLayout,
    total_length: u64,
    requested: ReadableSize,
    config: &StoreConfig,
    mode: Attach,
) -> Result<Attached> {
    let path = layout.store_path();

    let exists = tokio::fs::try_exists(&path)
        .await
        .context(IoSnafu { path: &path })?;
    if !exists {
        ensure!(mode == Attach::CreateOrReplace, JobNotFoundSnafu { path });
        return create_store(layout, total_length, requested, config, OpenedAs::Fresh).await;
    }

    let (stale, reason) = match JobStore::open(&path, config).await {
        Ok(store) => match store.original_file().await {
            Ok(Some(plan)) if plan_fits(&plan, layout, total_length) => {
                if plan.segment_size != requested {
                    warn!(
                        recorded = %plan.segment_size,
                        %requested,
                        "Keeping the segment size the job was planned with"
                    );
                }
                return Ok(Attached {
                    store,
                    opened_as: OpenedAs::Resumed,
                    segment_size: plan.segment_size,
                });
            }
            Ok(plan) => (Some(store), format!("recorded plan {plan:?} does not fit the target")),
            Err(e) => (Some(store), e.to_string()),
        },
        Err(e) => (None, e.to_string()),
    };

    if mode == Attach::ExistingOnly {
        if let Some(store) = stale {
            store.close().await;
        }
        return CorruptStoreSnafu { message: reason }.fail();
    }

    warn!(%reason, "Replacing job store {}", path.display());
    match stale {
        Some(store) => store.destroy().await?,
        None => remove_if_exists(&path).await?,
    }
    create_store(layout, total_length, requested, config, OpenedAs::Replaced).await
}

/// Best-effort removal of a part output; failures are logged.
async fn remove_part_output(part_id: PartId, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(%part_id, "Deleted {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(%part_id, error = %e, "Failed to delete {}", path.display()),
    }
}

/// Buffer size for reading and writing part outputs during assembly.
const MERGE_BUFFER_SIZE: usize = 512 * 1024;

async fn append_parts(head: &Path, tail: &[CompletedPart]) -> Result<()> {
    let file = OpenOptions::new()
        .append(true)
        .open(head)
        .await
        .context(IoSnafu { path: head })?;
    let mut writer = BufWriter::with_capacity(MERGE_BUFFER_SIZE, file);

    for part in tail {
        let file = File::open(&part.path)
            .await
            .context(IoSnafu { path: &part.path })?;
        let mut reader = BufReader::with_capacity(MERGE_BUFFER_SIZE, file);
        let copied = tokio::io::copy_buf(&mut reader, &mut writer)
            .await
            .context(IoSnafu { path: &part.path })?;
        debug!(part_id = %part.part_id, copied, "Appended part");
    }

    writer.flush().await.context(IoSnafu { path: head })?;
    writer
        .get_ref()
        .sync_all()
        .await
        .context(IoSnafu { path: head })?;
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::err::Error;

    async fn setup(data: &[u8], segment: u64) -> (TempDir, PathBuf, JobConfig) {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("input.bin");
        tokio::fs::write(&target, data).await.unwrap();
        let config = JobConfig::builder()
            .workspace_root(dir.path().join("workdir"))
            .segment_size(ReadableSize(segment))
            .build();
        (dir, target, config)
    }

    #[tokio::test]
    async fn fresh_open_plans_all_parts() {
        let (_dir, target, config) = setup(&[1u8; 1001], 250).await;
        let job = JobController::open(config, &target).await.unwrap();

        assert_eq!(job.opened_as(), OpenedAs::Fresh);
        assert!(!job.reset_occurred());
        assert!(!job.is_resuming());
        assert!(!job.is_blocked());
        assert_eq!(job.total_length(), 1001);
        assert_eq!(
            job.status().await.unwrap(),
            JobStatus {
                total:     5,
                completed: 0,
                pending:   5,
            }
        );
        assert!(job.layout().store_path().exists());
    }

    #[tokio::test]
    async fn read_part_bytes_returns_exact_range() {
        let data: Vec<u8> = (0..1001u32).map(|i| (i % 251) as u8).collect();
        let (_dir, target, config) = setup(&data, 250).await;
        let job = JobController::open(config, &target).await.unwrap();

        assert_eq!(job.read_part_bytes(PartId::new(2)).await.unwrap(), &data[250..500]);
        assert_eq!(job.read_part_bytes(PartId::new(5)).await.unwrap(), &data[1000..]);
    }

    #[tokio::test]
    async fn unknown_part_is_not_found() {
        let (_dir, target, config) = setup(b"hello world", 4).await;
        let job = JobController::open(config, &target).await.unwrap();

        assert!(matches!(
            job.lookup_range(PartId::new(9)).await,
            Err(Error::PartNotFound { .. })
        ));
        assert!(matches!(
            job.read_part_bytes(PartId::new(0)).await,
            Err(Error::PartNotFound { .. })
        ));
        assert!(matches!(
            job.record_completion(PartId::new(9), "1", Path::new("x")).await,
            Err(Error::PartNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let (_dir, target, config) = setup(b"", 4).await;
        assert!(matches!(
            JobController::open(config, &target).await,
            Err(Error::Partition { .. })
        ));
    }

    #[tokio::test]
    async fn final_output_len_requires_final_output() {
        let (_dir, target, config) = setup(b"abc", 2).await;
        let job = JobController::open(config, &target).await.unwrap();
        assert!(matches!(
            job.final_output_len().await,
            Err(Error::FinalOutputMissing { .. })
        ));
    }

    #[tokio::test]
    async fn finalize_before_completion_is_rejected() {
        let (_dir, target, config) = setup(b"abcdef", 2).await;
        let mut job = JobController::open(config, &target).await.unwrap();
        assert_eq!(
            job.verify().await.unwrap(),
            Verification::Pending { count: 3 }
        );
        assert!(matches!(
            job.finalize().await,
            Err(Error::NotVerified { .. })
        ));
    }

    /// Plans, completes nothing, then leaves a final output behind.
    /// Returns the final output and store paths.
    async fn planned_with_final(config: &JobConfig, target: &Path) -> (PathBuf, PathBuf) {
        let job = JobController::open(config.clone(), target).await.unwrap();
        let final_path = job.layout().final_output_path();
        let store_path = job.layout().store_path();
        tokio::fs::write(&final_path, b"assembled").await.unwrap();
        job.close().await;
        (final_path, store_path)
    }

    async fn tamper_part_count(store_path: &Path) {
        let store = JobStore::open(store_path, &StoreConfig::default())
            .await
            .unwrap();
        sqlx::query("UPDATE OriginalFile SET part_count = 99")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn replacement_removes_stale_final_output() {
        let (_dir, target, config) = setup(&[7u8; 1000], 100).await;
        let (final_path, store_path) = planned_with_final(&config, &target).await;
        tamper_part_count(&store_path).await;

        let job = JobController::open(config, &target).await.unwrap();
        assert_eq!(job.opened_as(), OpenedAs::Replaced);
        assert!(!job.is_blocked());
        assert!(!final_path.exists());
        assert_eq!(job.status().await.unwrap().total, 10);
    }

    #[tokio::test]
    async fn different_segment_size_keeps_recorded_plan() {
        let (_dir, target, config) = setup(&[7u8; 1000], 100).await;
        let (final_path, _) = planned_with_final(&config, &target).await;

        let other = JobConfig {
            segment_size: ReadableSize(300),
            ..config
        };
        let job = JobController::open(other, &target).await.unwrap();
        assert_eq!(job.opened_as(), OpenedAs::Resumed);
        assert_eq!(job.segment_size(), ReadableSize(100));
        assert_eq!(job.status().await.unwrap().total, 10);
        assert_eq!(job.blocked_on(), Some(final_path.as_path()));
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn open_existing_requires_a_plan() {
        let (_dir, target, config) = setup(b"hello world", 4).await;
        assert!(matches!(
            JobController::open_existing(config.clone(), &target).await,
            Err(Error::JobNotFound { .. })
        ));
        assert!(!config.workspace_root.exists());
    }

    #[tokio::test]
    async fn open_existing_leaves_final_output_alone() {
        let (_dir, target, config) = setup(&[7u8; 1000], 100).await;
        let (final_path, _) = planned_with_final(&config, &target).await;

        let job = JobController::open_existing(config, &target).await.unwrap();
        assert_eq!(job.opened_as(), OpenedAs::Resumed);
        assert!(job.is_blocked());
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn open_existing_refuses_inconsistent_store() {
        let (_dir, target, config) = setup(&[7u8; 1000], 100).await;
        let (final_path, store_path) = planned_with_final(&config, &target).await;
        tamper_part_count(&store_path).await;
        let before = tokio::fs::read(&store_path).await.unwrap();

        assert!(matches!(
            JobController::open_existing(config, &target).await,
            Err(Error::CorruptStore { .. })
        ));
        assert_eq!(tokio::fs::read(&store_path).await.unwrap(), before);
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn reset_part_only_reopens_that_part() {
        let (_dir, target, config) = setup(b"abcdef", 2).await;
        let job = JobController::open(config, &target).await.unwrap();
        for id in 1..=3 {
            let part_id = PartId::new(id);
            let path = job.layout().part_output_path(part_id);
            tokio::fs::write(&path, job.read_part_bytes(part_id).await.unwrap())
                .await
                .unwrap();
            job.record_completion(part_id, "2", &path).await.unwrap();
        }

        job.reset_part(PartId::new(2)).await.unwrap();
        assert_eq!(job.pending_part_ids().await.unwrap(), vec![PartId::new(2)]);
        assert!(!job.layout().part_output_path(PartId::new(2)).exists());
        assert!(job.layout().part_output_path(PartId::new(1)).exists());
        assert!(matches!(
            job.reset_part(PartId::new(4)).await,
            Err(Error::PartNotFound { .. })
        ));
    }
}
