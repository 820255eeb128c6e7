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

use std::path::PathBuf;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use shardkeep_base::readable_size::ReadableSize;
use strum_macros::{Display as StrumDisplay, EnumString};

/// Id assigned to the first part of a plan. Ids are dense and ascending from
/// here, in the same order as the ranges they name.
pub const PART_ID_ORIGIN: i64 = 1;

/// Identifier of one part within a job.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[display("{_0}")]
#[sqlx(transparent)]
pub struct PartId(i64);

impl PartId {
    #[must_use]
    pub const fn new(id: i64) -> Self { Self(id) }

    /// Id of the part at `index` in partition order.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn from_index(index: usize) -> Self { Self(PART_ID_ORIGIN + index as i64) }

    #[must_use]
    pub const fn get(self) -> i64 { self.0 }
}

/// Half-open byte range `[start, end)` of the target file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[display("[{start}, {end})")]
pub struct ByteRange {
    pub start: u64,
    pub end:   u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self { Self { start, end } }

    #[must_use]
    pub const fn len(&self) -> u64 { self.end - self.start }

    #[must_use]
    pub const fn is_empty(&self) -> bool { self.start == self.end }
}

impl From<(u64, u64)> for ByteRange {
    fn from((start, end): (u64, u64)) -> Self { Self { start, end } }
}

/// What a job store recorded about its plan when it was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRecord {
    pub file_identity: String,
    pub part_count:    usize,
    /// Segment size the plan was computed with.
    pub segment_size:  ReadableSize,
}

/// A part whose checksum and output location have both been recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_id: PartId,
    /// Integrity token reported by whoever produced the output.
    pub token:   String,
    /// Where the processed bytes were written.
    pub path:    PathBuf,
}

/// How a [`crate::JobController`] came to hold its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OpenedAs {
    /// No store existed; a new plan was recorded.
    Fresh,
    /// An existing store matched the current plan.
    Resumed,
    /// An existing store disagreed with the current plan and was discarded.
    Replaced,
}

/// Progress counters for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{completed}/{total} parts complete, {pending} pending")]
pub struct JobStatus {
    pub total:     usize,
    pub completed: usize,
    pub pending:   usize,
}

/// Outcome of checking every recorded output against its token.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Verification {
    #[display("all parts verified")]
    Complete,

    #[display("{count} part(s) still pending")]
    Pending { count: usize },

    #[display("output for part {part_id} is missing at {}", path.display())]
    MissingOutput { part_id: PartId, path: PathBuf },

    #[display("part {part_id} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        part_id:  PartId,
        expected: String,
        actual:   String,
    },
}

impl Verification {
    #[must_use]
    pub const fn is_complete(&self) -> bool { matches!(self, Self::Complete) }

    /// Part that failed verification, if any.
    #[must_use]
    pub const fn failed_part(&self) -> Option<PartId> {
        match self {
            Self::MissingOutput { part_id, .. } | Self::ChecksumMismatch { part_id, .. } => {
                Some(*part_id)
            }
            Self::Complete | Self::Pending { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_ids_start_at_origin() {
        assert_eq!(PartId::from_index(0).get(), PART_ID_ORIGIN);
        assert_eq!(PartId::from_index(4).get(), PART_ID_ORIGIN + 4);
    }

    #[test]
    fn verification_reports_failed_part() {
        let v = Verification::ChecksumMismatch {
            part_id:  PartId::new(3),
            expected: "10".into(),
            actual:   "9".into(),
        };
        assert!(!v.is_complete());
        assert_eq!(v.failed_part(), Some(PartId::new(3)));
        assert_eq!(
            v.to_string(),
            "part 3 checksum mismatch: expected 10, got 9"
        );
        assert_eq!(Verification::Pending { count: 2 }.failed_part(), None);
    }
}
