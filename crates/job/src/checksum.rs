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

//! Two different things get hashed here:
//!
//! - [`ContentDigest`] names a workspace. It is always a SHA-256 over the
//!   whole target file.
//! - A part token ([`part_token`]) is the integrity check recorded for one
//!   processed part. Depending on [`ChecksumMode`] it is either the output's
//!   byte length or its SHA-256.

use std::path::Path;

use derive_more::Display;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

use crate::{
    config::ChecksumMode,
    err::{IoSnafu, Result},
};

/// Files are hashed in chunks of this size so memory stays flat no matter
/// how large the target is.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a file's full content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{_0}")]
pub struct ContentDigest(String);

impl ContentDigest {
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

async fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).await.context(IoSnafu { path })?;
    let mut reader = BufReader::with_capacity(HASH_CHUNK_SIZE, file);
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut hasher = Sha256::new();

    loop {
        let n = reader.read(&mut buffer).await.context(IoSnafu { path })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Stream `path` through SHA-256.
#[tracing::instrument(level = "debug", err)]
pub async fn content_digest(path: &Path) -> Result<ContentDigest> {
    sha256_file(path).await.map(ContentDigest)
}

/// Compute the integrity token of a processed part file.
pub async fn part_token(path: &Path, mode: ChecksumMode) -> Result<String> {
    match mode {
        ChecksumMode::Length => {
            let metadata = tokio::fs::metadata(path).await.context(IoSnafu { path })?;
            Ok(metadata.len().to_string())
        }
        ChecksumMode::Sha256 => sha256_file(path).await,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn digest_is_stable_and_content_sensitive() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"hello").await.unwrap();
        tokio::fs::write(&b, b"hello!").await.unwrap();

        let da = content_digest(&a).await.unwrap();
        assert_eq!(
            da.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(da, content_digest(&a).await.unwrap());
        assert_ne!(da, content_digest(&b).await.unwrap());
    }

    #[tokio::test]
    async fn digest_spans_multiple_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        let data = vec![7u8; HASH_CHUNK_SIZE * 3 + 5];
        tokio::fs::write(&path, &data).await.unwrap();

        let expected = format!("{:x}", Sha256::digest(&data));
        assert_eq!(content_digest(&path).await.unwrap().as_str(), expected);
    }

    #[tokio::test]
    async fn part_token_by_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part_1.zst");
        tokio::fs::write(&path, b"hello").await.unwrap();

        assert_eq!(part_token(&path, ChecksumMode::Length).await.unwrap(), "5");
        assert_eq!(
            part_token(&path, ChecksumMode::Sha256).await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn part_token_of_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(part_token(&missing, ChecksumMode::Length).await.is_err());
    }
}
