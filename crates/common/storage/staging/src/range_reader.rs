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

use std::io::{ErrorKind, SeekFrom};

use snafu::{ResultExt, ensure};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, Take},
};
use tokio_util::io::ReaderStream;

use crate::{
    error::{ArtifactNotFoundSnafu, InvalidRangeSnafu, IoSnafu, Result},
    path::Layout,
    types::ArtifactStat,
};

/// Stream of the bytes of one range, in order.
pub type RangeStream = ReaderStream<Take<File>>;

/// Serves sizes and inclusive byte ranges of completed artifacts.
///
/// Only reads published artifacts and takes no root lock, so it may run next
/// to the process that owns the root.
#[derive(Debug, Clone)]
pub struct RangeReader {
    layout:      Layout,
    buffer_size: usize,
}

impl RangeReader {
    pub const fn new(layout: Layout, buffer_size: usize) -> Self {
        Self {
            layout,
            buffer_size,
        }
    }

    pub async fn stat(&self, name: &str) -> Result<ArtifactStat> {
        let path = self.layout.artifact_path(name);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return ArtifactNotFoundSnafu { name }.fail(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ArtifactNotFoundSnafu { name }.fail();
            }
            Err(e) => return Err(e).context(IoSnafu { path }),
        };
        Ok(ArtifactStat {
            size:         metadata.len(),
            display_name: name.to_string(),
        })
    }

    /// Bytes `start..=end` of the artifact.
    ///
    /// Requires `start <= end < size`, so an empty artifact has no valid
    /// range.
    pub async fn read_range(&self, name: &str, start: u64, end: u64) -> Result<RangeStream> {
        let path = self.layout.artifact_path(name);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ArtifactNotFoundSnafu { name }.fail();
            }
            Err(e) => return Err(e).context(IoSnafu { path }),
        };

        let metadata = file
            .metadata()
            .await
            .context(IoSnafu { path: path.clone() })?;
        ensure!(metadata.is_file(), ArtifactNotFoundSnafu { name });
        let size = metadata.len();
        ensure!(
            start <= end && end < size,
            InvalidRangeSnafu {
                name,
                start,
                end,
                size,
            }
        );

        file.seek(SeekFrom::Start(start))
            .await
            .context(IoSnafu { path })?;
        Ok(ReaderStream::with_capacity(
            file.take(end - start + 1),
            self.buffer_size,
        ))
    }
}
