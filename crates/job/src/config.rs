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

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use serde::{Deserialize, Serialize};
use shardkeep_base::readable_size::ReadableSize;
use smart_default::SmartDefault;
use strum_macros::{Display, EnumString};

use crate::partition::DEFAULT_SEGMENT_SIZE;

/// How the integrity token of a processed part is computed.
///
/// `Length` only proves the output has the expected size; it is not a content
/// check. `Sha256` hashes the whole output.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumMode {
    #[default]
    Length,
    Sha256,
}

/// SQLite connection settings shared by the job and history stores.
#[derive(Debug, Clone, SmartDefault, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of pooled connections
    #[default = 4]
    #[builder(default = 4)]
    pub max_connections: u32,

    /// Time to wait for a pooled connection (default: 30 seconds)
    #[default(_code = "Duration::from_secs(30)")]
    #[builder(default = Duration::from_secs(30))]
    pub connect_timeout: Duration,

    /// How long a statement waits on a locked database (default: 5 seconds)
    #[default(_code = "Duration::from_secs(5)")]
    #[builder(default = Duration::from_secs(5))]
    pub busy_timeout: Duration,
}

/// Everything a [`crate::JobController`] needs besides the target path.
#[derive(Debug, Clone, SmartDefault, Builder, Serialize, Deserialize)]
#[builder(on(String, into), on(PathBuf, into))]
#[serde(default)]
pub struct JobConfig {
    /// Root under which one content-addressed directory per target is kept
    #[default(_code = "PathBuf::from(\"workdir\")")]
    #[builder(default = PathBuf::from("workdir"))]
    pub workspace_root: PathBuf,

    /// Upper bound on the size of a part when a new plan is made (default:
    /// 64MiB). A resumed job keeps the size it was planned with.
    #[default(DEFAULT_SEGMENT_SIZE)]
    #[builder(default = DEFAULT_SEGMENT_SIZE)]
    pub segment_size: ReadableSize,

    /// Token recorded for, and recomputed from, each processed part
    #[builder(default)]
    pub checksum_mode: ChecksumMode,

    /// Extension of processed part files and of the final output
    #[default = "zst"]
    #[builder(default = "zst".to_string())]
    pub output_extension: String,

    #[builder(default)]
    pub store: StoreConfig,
}
