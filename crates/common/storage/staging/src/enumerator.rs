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

use std::io::ErrorKind;

use snafu::{ResultExt, ensure};
use tokio::fs;

use crate::{
    error::{CorruptChunkSnafu, IncompleteUploadSnafu, IoSnafu, Result, StagingNotFoundSnafu},
    path::{Layout, parse_chunk_index},
    types::ChunkEntry,
};

/// How many missing indices an incomplete-upload error carries.
const MISSING_REPORT_LIMIT: usize = 16;

/// Lists the chunks staged for a name in ascending index order.
#[derive(Debug, Clone)]
pub struct ChunkEnumerator {
    layout: Layout,
}

impl ChunkEnumerator {
    pub const fn new(layout: Layout) -> Self { Self { layout } }

    /// Every staged chunk of `name`, sorted by index.
    ///
    /// Ordering never depends on the order the directory returns its
    /// entries in. An entry whose name does not parse as `<name>-<index>`,
    /// or that is not a regular file, fails the listing.
    pub async fn list(&self, name: &str) -> Result<Vec<ChunkEntry>> {
        let dir = self.layout.staging_dir(name);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return StagingNotFoundSnafu { name }.fail();
            }
            Err(e) => return Err(e).context(IoSnafu { path: dir }),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { path: dir.clone() })?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let index = parse_chunk_index(name, &file_name)?;

            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .context(IoSnafu { path: path.clone() })?;
            ensure!(
                metadata.is_file(),
                CorruptChunkSnafu {
                    name,
                    entry: file_name,
                    reason: "entry is not a regular file",
                }
            );

            chunks.push(ChunkEntry {
                index,
                size: metadata.len(),
                path,
            });
        }

        chunks.sort_unstable_by_key(|chunk| chunk.index);
        Ok(chunks)
    }
}

/// Check that `chunks` (sorted, as returned by [`ChunkEnumerator::list`])
/// covers exactly `0..expected`.
pub fn ensure_complete(name: &str, expected: u64, chunks: &[ChunkEntry]) -> Result<()> {
    ensure!(!chunks.is_empty(), StagingNotFoundSnafu { name });

    let complete = chunks.len() as u64 == expected
        && chunks
            .iter()
            .zip(0u64..)
            .all(|(chunk, index)| chunk.index == index);
    if complete {
        return Ok(());
    }

    let mut staged = chunks.iter().map(|chunk| chunk.index).peekable();
    let mut missing = Vec::new();
    for index in 0..expected {
        while staged.next_if(|&seen| seen < index).is_some() {}
        if staged.next_if_eq(&index).is_none() {
            missing.push(index);
            if missing.len() == MISSING_REPORT_LIMIT {
                break;
            }
        }
    }

    IncompleteUploadSnafu {
        name,
        expected,
        actual: chunks.len(),
        missing,
    }
    .fail()
}
