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

//! Durable bookkeeping for splitting a large file into byte-range parts,
//! tracking which parts have been processed elsewhere, and stitching the
//! processed outputs back together in order.
//!
//! The entry point is [`JobController`]. A dispatch layer pulls
//! [`JobController::pending_part_ids`], reads each part with
//! [`JobController::read_part_bytes`], processes it however it likes, and
//! reports back through [`JobController::record_completion`]. Once nothing is
//! pending, [`JobController::verify`] and [`JobController::finalize`] produce
//! the reassembled output.

pub mod checksum;
mod config;
mod controller;
mod err;
mod history;
pub mod partition;
mod store;
mod types;
mod workspace;

pub use checksum::{ContentDigest, content_digest, part_token};
pub use config::{ChecksumMode, JobConfig, StoreConfig};
pub use controller::JobController;
pub use err::{Error, Result};
pub use history::{HISTORY_FILE_NAME, HistoryStore, RUN_INTERVAL};
pub use partition::{DEFAULT_SEGMENT_SIZE, PartitionError, partition};
pub use store::JobStore;
pub use types::{
    ByteRange, CompletedPart, JobStatus, OpenedAs, PART_ID_ORIGIN, PartId, PlanRecord, Verification,
};
pub use workspace::{STORE_FILE_NAME, WorkspaceLayout};
