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

use snafu::{OptionExt, ResultExt};
use tokio::fs;

use crate::{
    checksum::{ContentDigest, content_digest},
    err::{InvalidTargetSnafu, IoSnafu, Result},
    types::PartId,
};

/// Name of the job store file inside a job directory.
pub const STORE_FILE_NAME: &str = "work.db";

const PARTS_DIR_NAME: &str = "parts";
const FINAL_DIR_NAME: &str = "final";

/// On-disk layout for one target file:
///
/// ```text
/// <root>/
///   <sha256 of target>/
///     work.db
///     parts/part_<id>.<ext>
///     final/<target name>.<ext>
/// ```
///
/// Paths are derived on construction; nothing is created until
/// [`WorkspaceLayout::ensure_exists`].
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root:             PathBuf,
    identity:         ContentDigest,
    job_dir:          PathBuf,
    parts_dir:        PathBuf,
    final_dir:        PathBuf,
    target_name:      String,
    output_extension: String,
}

impl WorkspaceLayout {
    /// Hash `target` and derive every workspace path from the digest.
    #[tracing::instrument(level = "debug", skip(root), err)]
    pub async fn new(root: &Path, target: &Path, output_extension: &str) -> Result<Self> {
        let target_name = target
            .file_name()
            .context(InvalidTargetSnafu { path: target })?
            .to_string_lossy()
            .into_owned();
        let identity = content_digest(target).await?;
        let job_dir = root.join(identity.as_str());

        Ok(Self {
            root: root.to_path_buf(),
            parts_dir: job_dir.join(PARTS_DIR_NAME),
            final_dir: job_dir.join(FINAL_DIR_NAME),
            job_dir,
            identity,
            target_name,
            output_extension: output_extension.to_string(),
        })
    }

    /// Create root, job, parts and final directories. Safe to call repeatedly.
    pub async fn ensure_exists(&self) -> Result<()> {
        for dir in [&self.root, &self.job_dir, &self.parts_dir, &self.final_dir] {
            fs::create_dir_all(dir).await.context(IoSnafu { path: dir })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path { &self.root }

    /// Content digest naming the job directory.
    pub const fn identity(&self) -> &ContentDigest { &self.identity }

    pub fn job_dir(&self) -> &Path { &self.job_dir }

    pub fn parts_dir(&self) -> &Path { &self.parts_dir }

    pub fn final_dir(&self) -> &Path { &self.final_dir }

    pub fn store_path(&self) -> PathBuf { self.job_dir.join(STORE_FILE_NAME) }

    /// Where the processed output of `part_id` is expected to land.
    pub fn part_output_path(&self, part_id: PartId) -> PathBuf {
        self.parts_dir
            .join(format!("part_{part_id}.{}", self.output_extension))
    }

    /// `final/<target name>.<ext>`
    pub fn final_output_path(&self) -> PathBuf {
        self.final_dir
            .join(format!("{}.{}", self.target_name, self.output_extension))
    }
}
