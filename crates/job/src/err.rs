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

use snafu::Snafu;

use crate::{partition::PartitionError, types::PartId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(transparent)]
    Sqlx {
        source: sqlx::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(transparent)]
    Partition {
        source: PartitionError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("I/O error at {}", path.display()))]
    Io {
        path:   PathBuf,
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to read part {part_id} from {}", path.display()))]
    ReadPart {
        part_id: PartId,
        path:    PathBuf,
        source:  std::io::Error,
    },

    #[snafu(display("Blocking task failed"))]
    Join { source: tokio::task::JoinError },

    #[snafu(display("Target {} has no file name", path.display()))]
    InvalidTarget { path: PathBuf },

    #[snafu(display("Part {part_id} does not exist in this job"))]
    PartNotFound { part_id: PartId },

    #[snafu(display("Part {part_id} is {len} bytes, too large to buffer in memory"))]
    PartTooLarge { part_id: PartId, len: u64 },

    #[snafu(display("No job has been planned at {}", path.display()))]
    JobNotFound { path: PathBuf },

    #[snafu(display("Job store holds an invalid value: {message}"))]
    CorruptStore { message: String },

    #[snafu(display("Final output {} does not exist yet", path.display()))]
    FinalOutputMissing { path: PathBuf },

    #[snafu(display(
        "Final output {} already exists; confirm discarding it before continuing",
        path.display()
    ))]
    BlockedOnExistingOutput { path: PathBuf },

    #[snafu(display("Job is not ready to finalize: {reason}"))]
    NotVerified { reason: String },

    #[snafu(display("Invalid history timestamp"))]
    Timestamp { source: jiff::Error },
}
