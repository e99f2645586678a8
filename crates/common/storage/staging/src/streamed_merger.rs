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

use std::{io::SeekFrom, path::Path};

use futures::{StreamExt, TryStreamExt, stream};
use snafu::{ResultExt, ensure};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter},
};
use tracing::debug;

use crate::{
    artifact::{PartialArtifact, sha256_file},
    buffered_merger::WrittenArtifact,
    error::{IoSnafu, Result, SizeMismatchSnafu},
    path::Layout,
    types::ChunkEntry,
};

/// Where one chunk lands in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    pub size:   u64,
}

/// Byte offset of every chunk, given chunks sorted by index. Returns the
/// placements and the total artifact size.
pub fn plan_offsets(chunks: &[ChunkEntry]) -> (Vec<Placement>, u64) {
    let mut offset = 0;
    let placements = chunks
        .iter()
        .map(|chunk| {
            let placement = Placement {
                offset,
                size: chunk.size,
            };
            offset += chunk.size;
            placement
        })
        .collect();
    (placements, offset)
}

/// Reassembles an artifact with memory bounded by the I/O buffer size.
///
/// The merge runs in two passes. The size pass turns the staged sizes into
/// fixed offsets, and the write pass copies each chunk into its own region
/// of a pre-sized file. Regions never overlap, so chunks are copied
/// concurrently without affecting the byte order of the result.
#[derive(Debug, Clone)]
pub struct StreamedMerger {
    layout:      Layout,
    concurrency: usize,
    buffer_size: usize,
    sync_writes: bool,
}

impl StreamedMerger {
    pub const fn new(
        layout: Layout,
        concurrency: usize,
        buffer_size: usize,
        sync_writes: bool,
    ) -> Self {
        Self {
            layout,
            concurrency,
            buffer_size,
            sync_writes,
        }
    }

    /// Copy `chunks` (sorted by index) into a partial artifact. The SHA256
    /// is only computed when `hash` is set, since it costs a full re-read.
    pub async fn write(
        &self,
        name: &str,
        chunks: &[ChunkEntry],
        hash: bool,
    ) -> Result<WrittenArtifact> {
        let (placements, total) = plan_offsets(chunks);

        let (partial, file) = PartialArtifact::create(&self.layout, name).await?;
        file.set_len(total)
            .await
            .context(IoSnafu { path: partial.path() })?;

        let path = partial.path();
        stream::iter(chunks.iter().zip(placements))
            .map(Ok)
            .try_for_each_concurrent(self.concurrency.max(1), |(chunk, placement)| async move {
                self.copy_chunk(name, chunk, placement, path).await
            })
            .await?;

        if self.sync_writes {
            file.sync_all()
                .await
                .context(IoSnafu { path: partial.path() })?;
        }
        drop(file);

        let sha256 = if hash {
            Some(sha256_file(partial.path(), self.buffer_size).await?)
        } else {
            None
        };

        debug!(name, chunks = chunks.len(), size = total, "Streamed merge written");
        Ok(WrittenArtifact {
            partial,
            size: total,
            sha256,
        })
    }

    async fn copy_chunk(
        &self,
        name: &str,
        chunk: &ChunkEntry,
        placement: Placement,
        target: &Path,
    ) -> Result<()> {
        let source = File::open(&chunk.path)
            .await
            .context(IoSnafu { path: &chunk.path })?;
        let mut reader =
            BufReader::with_capacity(self.buffer_size, source).take(placement.size);

        let mut out = OpenOptions::new()
            .write(true)
            .open(target)
            .await
            .context(IoSnafu { path: target })?;
        out.seek(SeekFrom::Start(placement.offset))
            .await
            .context(IoSnafu { path: target })?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, out);

        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .context(IoSnafu { path: &chunk.path })?;
        writer.flush().await.context(IoSnafu { path: target })?;

        ensure!(
            copied == placement.size,
            SizeMismatchSnafu {
                name,
                expected: placement.size,
                actual: copied,
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::fs;

    use super::*;
    use crate::{enumerator::ChunkEnumerator, error::StagingError};

    #[test]
    fn test_plan_offsets() {
        let chunks: Vec<ChunkEntry> = [4u64, 0, 7, 1]
            .iter()
            .enumerate()
            .map(|(index, &size)| ChunkEntry {
                index: index as u64,
                size,
                path: PathBuf::new(),
            })
            .collect();

        let (placements, total) = plan_offsets(&chunks);
        let offsets: Vec<u64> = placements.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 4, 4, 11]);
        assert_eq!(total, 12);
        assert_eq!(plan_offsets(&[]), (vec![], 0));
    }

    async fn stage(layout: &Layout, chunks: &[Vec<u8>]) -> Vec<ChunkEntry> {
        fs::create_dir_all(layout.staging_dir("f")).await.unwrap();
        for (index, data) in chunks.iter().enumerate() {
            fs::write(layout.chunk_path("f", index as u64), data)
                .await
                .unwrap();
        }
        ChunkEnumerator::new(layout.clone())
            .list("f")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_places_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let data: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 1000 + usize::from(i)]).collect();
        let chunks = stage(&layout, &data).await;

        let merger = StreamedMerger::new(layout, 4, 64, false);
        let written = merger.write("f", &chunks, true).await.unwrap();
        let expected = data.concat();
        assert_eq!(written.size, expected.len() as u64);
        assert!(written.sha256.is_some());

        let path = written.partial.persist().await.unwrap();
        assert_eq!(fs::read(path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_detects_shrunk_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let chunks = stage(&layout, &[b"AAAA".to_vec(), b"BBBB".to_vec()]).await;
        fs::write(&chunks[1].path, b"BB").await.unwrap();

        let merger = StreamedMerger::new(layout.clone(), 2, 64, false);
        assert!(matches!(
            merger.write("f", &chunks, false).await,
            Err(StagingError::SizeMismatch {
                expected: 4,
                actual: 2,
                ..
            })
        ));
        let leftovers = std::fs::read_dir(layout.artifact_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
