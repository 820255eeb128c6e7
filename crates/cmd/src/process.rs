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

//! Local part processing: each pending part is compressed into its own zstd
//! frame. Concatenated frames form a valid zstd stream, so the assembled
//! output decompresses to the original file.

use futures::{StreamExt, stream};
use shardkeep_job::{JobController, PartId, Verification, part_token};
use snafu::{ResultExt, Whatever};
use tracing::{info, warn};

/// Compression level used when none is given.
pub const DEFAULT_LEVEL: i32 = 3;

/// Verify rounds that may reprocess a failed part before giving up.
const MAX_REPAIR_ROUNDS: usize = 3;

async fn process_part(job: &JobController, part_id: PartId, level: i32) -> Result<PartId, Whatever> {
    let bytes = job
        .read_part_bytes(part_id)
        .await
        .with_whatever_context(|_| format!("Failed to read part {part_id}"))?;

    let compressed = tokio::task::spawn_blocking(move || zstd::bulk::compress(&bytes, level))
        .await
        .whatever_context("Compression task failed")?
        .with_whatever_context(|_| format!("Failed to compress part {part_id}"))?;

    let out = job.layout().part_output_path(part_id);
    tokio::fs::write(&out, &compressed)
        .await
        .with_whatever_context(|_| format!("Failed to write {}", out.display()))?;

    let token = part_token(&out, job.config().checksum_mode)
        .await
        .with_whatever_context(|_| format!("Failed to checksum {}", out.display()))?;
    job.record_completion(part_id, &token, &out)
        .await
        .with_whatever_context(|_| format!("Failed to record part {part_id}"))?;
    Ok(part_id)
}

/// Compress every pending part with at most `jobs` parts in flight.
///
/// Returns how many parts were processed. Stops at the first failure; parts
/// already recorded stay recorded.
pub async fn process_pending(job: &JobController, jobs: usize, level: i32) -> Result<usize, Whatever> {
    let pending = job
        .pending_part_ids()
        .await
        .whatever_context("Failed to list pending parts")?;
    let total = pending.len();

    let mut results = stream::iter(pending)
        .map(|part_id| process_part(job, part_id, level))
        .buffer_unordered(jobs.max(1));

    let mut done = 0;
    while let Some(result) = results.next().await {
        let part_id = result?;
        done += 1;
        info!(%part_id, done, total, "Processed part");
    }
    Ok(done)
}

/// Verify the job, redoing any part whose output is missing or does not
/// match its recorded token.
///
/// Each round resets and reprocesses the first failing part. Returns the
/// last verification, which is still incomplete if failures remain after
/// [`MAX_REPAIR_ROUNDS`] rounds.
pub async fn verify_and_repair(
    job: &JobController,
    jobs: usize,
    level: i32,
) -> Result<Verification, Whatever> {
    let mut verification = job.verify().await.whatever_context("Failed to verify")?;
    for round in 1..=MAX_REPAIR_ROUNDS {
        let Some(part_id) = verification.failed_part() else {
            break;
        };
        warn!(%part_id, round, "{verification}; processing the part again");
        job.reset_part(part_id)
            .await
            .with_whatever_context(|_| format!("Failed to reset part {part_id}"))?;
        process_pending(job, jobs, level).await?;
        verification = job.verify().await.whatever_context("Failed to verify")?;
    }
    Ok(verification)
}

#[cfg(test)]
mod tests {
    use shardkeep_base::readable_size::ReadableSize;
    use shardkeep_job::{JobConfig, Verification};
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn compressed_parts_assemble_into_one_stream() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).flat_map(u32::to_le_bytes).collect();
        let target = dir.path().join("numbers.bin");
        tokio::fs::write(&target, &data).await.unwrap();

        let config = JobConfig::builder()
            .workspace_root(dir.path().join("workdir"))
            .segment_size(ReadableSize::kb(4))
            .build();
        let mut job = JobController::open(config, &target).await.unwrap();

        assert_eq!(process_pending(&job, 4, DEFAULT_LEVEL).await.unwrap(), 10);
        assert_eq!(job.verify().await.unwrap(), Verification::Complete);
        assert_eq!(process_pending(&job, 4, DEFAULT_LEVEL).await.unwrap(), 0);

        let final_path = job.finalize().await.unwrap();
        let assembled = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(zstd::stream::decode_all(assembled.as_slice()).unwrap(), data);
    }

    #[tokio::test]
    async fn damaged_parts_are_reprocessed() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..4_000u32).flat_map(u32::to_le_bytes).collect();
        let target = dir.path().join("numbers.bin");
        tokio::fs::write(&target, &data).await.unwrap();

        let config = JobConfig::builder()
            .workspace_root(dir.path().join("workdir"))
            .segment_size(ReadableSize::kb(4))
            .build();
        let mut job = JobController::open(config, &target).await.unwrap();
        assert_eq!(process_pending(&job, 2, DEFAULT_LEVEL).await.unwrap(), 4);

        let untouched = job.layout().part_output_path(PartId::new(1));
        let before = std::fs::metadata(&untouched).unwrap().modified().unwrap();
        tokio::fs::remove_file(job.layout().part_output_path(PartId::new(2)))
            .await
            .unwrap();
        tokio::fs::write(job.layout().part_output_path(PartId::new(4)), b"x")
            .await
            .unwrap();

        let verification = verify_and_repair(&job, 2, DEFAULT_LEVEL).await.unwrap();
        assert_eq!(verification, Verification::Complete);
        assert_eq!(
            std::fs::metadata(&untouched).unwrap().modified().unwrap(),
            before
        );

        let final_path = job.finalize().await.unwrap();
        let assembled = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(zstd::stream::decode_all(assembled.as_slice()).unwrap(), data);
    }
}
