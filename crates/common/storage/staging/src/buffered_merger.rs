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

use bytes::BytesMut;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, ensure};
use splice_base::ReadableSize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

use crate::{
    artifact::PartialArtifact,
    error::{BufferLimitExceededSnafu, IoSnafu, Result, SizeMismatchSnafu},
    path::Layout,
    types::ChunkEntry,
};

/// Output of a merger: an artifact that is fully written and synced but not
/// yet visible under its name.
#[derive(Debug)]
pub struct WrittenArtifact {
    pub partial: PartialArtifact,
    pub size:    u64,
    pub sha256:  Option<String>,
}

/// Reassembles an artifact entirely in memory.
///
/// Suited for small artifacts: every chunk is read in ascending index order
/// into one buffer, which is then written out in a single write.
#[derive(Debug, Clone)]
pub struct BufferedMerger {
    layout:      Layout,
    limit:       ReadableSize,
    sync_writes: bool,
}

impl BufferedMerger {
    pub const fn new(layout: Layout, limit: ReadableSize, sync_writes: bool) -> Self {
        Self {
            layout,
            limit,
            sync_writes,
        }
    }

    /// Concatenate `chunks` (sorted by index) into a partial artifact.
    pub async fn write(&self, name: &str, chunks: &[ChunkEntry]) -> Result<WrittenArtifact> {
        let expected: u64 = chunks.iter().map(|chunk| chunk.size).sum();
        ensure!(
            expected <= self.limit.as_bytes(),
            BufferLimitExceededSnafu {
                name,
                size: expected,
                limit: self.limit,
            }
        );

        let mut buffer = BytesMut::with_capacity(usize::try_from(expected).unwrap_or_default());
        for chunk in chunks {
            let mut file = File::open(&chunk.path)
                .await
                .context(IoSnafu { path: &chunk.path })?;
            let mut data = Vec::with_capacity(usize::try_from(chunk.size).unwrap_or_default());
            file.read_to_end(&mut data)
                .await
                .context(IoSnafu { path: &chunk.path })?;
            buffer.extend_from_slice(&data);
        }

        let size = buffer.len() as u64;
        ensure!(
            size == expected,
            SizeMismatchSnafu {
                name,
                expected,
                actual: size,
            }
        );
        let sha256 = format!("{:x}", Sha256::digest(&buffer));

        let (partial, mut file) = PartialArtifact::create(&self.layout, name).await?;
        file.write_all(&buffer)
            .await
            .context(IoSnafu { path: partial.path() })?;
        file.flush()
            .await
            .context(IoSnafu { path: partial.path() })?;
        if self.sync_writes {
            file.sync_all()
                .await
                .context(IoSnafu { path: partial.path() })?;
        }
        drop(file);

        debug!(name, chunks = chunks.len(), size, "Buffered merge written");
        Ok(WrittenArtifact {
            partial,
            size,
            sha256: Some(sha256),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::fs;

    use super::*;
    use crate::{enumerator::ChunkEnumerator, error::StagingError};

    async fn stage(layout: &Layout, name: &str, chunks: &[&[u8]]) -> Vec<ChunkEntry> {
        fs::create_dir_all(layout.staging_dir(name)).await.unwrap();
        for (index, data) in chunks.iter().enumerate() {
            fs::write(layout.chunk_path(name, index as u64), data)
                .await
                .unwrap();
        }
        ChunkEnumerator::new(layout.clone())
            .list(name)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let chunks = stage(&layout, "f", &[b"AAAA", b"BBBB", b"CCCC"]).await;

        let merger = BufferedMerger::new(layout.clone(), ReadableSize::kb(1), false);
        let written = merger.write("f", &chunks).await.unwrap();
        assert_eq!(written.size, 12);
        assert_eq!(
            written.sha256.as_deref(),
            Some(format!("{:x}", Sha256::digest(b"AAAABBBBCCCC")).as_str())
        );
        assert!(!layout.artifact_path("f").exists());

        let path = written.partial.persist().await.unwrap();
        assert_eq!(fs::read(path).await.unwrap(), b"AAAABBBBCCCC");
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let chunks = stage(&layout, "f", &[b"0123456789"]).await;

        let merger = BufferedMerger::new(layout, ReadableSize(9), false);
        assert!(matches!(
            merger.write("f", &chunks).await,
            Err(StagingError::BufferLimitExceeded { size: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_chunks_are_kept_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let chunks = stage(&layout, "f", &[b"ab", b"", b"cd"]).await;

        let merger = BufferedMerger::new(layout, ReadableSize::kb(1), false);
        let written = merger.write("f", &chunks).await.unwrap();
        let path = written.partial.persist().await.unwrap();
        assert_eq!(fs::read(path).await.unwrap(), b"abcd");
    }
}
