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

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt, BufWriter},
};
use tracing::{debug, warn};

use crate::{
    error::{IoSnafu, Result},
    path::Layout,
};

/// Places uploaded chunks into per-name staging areas.
///
/// Every chunk is written to a private buffer under `incoming/` first and
/// renamed into the staging area once fully written, so an enumerator never
/// observes a half-written chunk and a re-upload of the same index replaces
/// the old one atomically.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    layout:      Layout,
    buffer_size: usize,
    sync_writes: bool,
}

impl ChunkStore {
    pub const fn new(layout: Layout, buffer_size: usize, sync_writes: bool) -> Self {
        Self {
            layout,
            buffer_size,
            sync_writes,
        }
    }

    pub const fn layout(&self) -> &Layout { &self.layout }

    /// Create the staging area for `name` if it does not exist yet.
    pub async fn ensure_staging_area(&self, name: &str) -> Result<PathBuf> {
        let dir = self.layout.staging_dir(name);
        fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: dir.clone() })?;
        Ok(dir)
    }

    /// Stage a chunk held in memory.
    pub async fn put(&self, name: &str, index: u64, bytes: &[u8]) -> Result<u64> {
        let mut reader = bytes;
        self.put_reader(name, index, &mut reader).await
    }

    /// Stage a chunk by draining `reader`. Returns the number of bytes staged.
    pub async fn put_reader<R>(&self, name: &str, index: u64, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let incoming = self.layout.incoming_path();
        let written = match self.write_incoming(&incoming, reader).await {
            Ok(written) => written,
            Err(e) => {
                discard(&incoming).await;
                return Err(e);
            }
        };

        if let Err(e) = self.place(name, index, &incoming).await {
            discard(&incoming).await;
            return Err(e);
        }

        debug!(name, index, size = written, "Staged chunk");
        Ok(written)
    }

    /// Stage a chunk the caller already wrote to a file. The file is moved
    /// into the staging area, or copied when it lives on another filesystem.
    pub async fn put_file(&self, name: &str, index: u64, source: &Path) -> Result<u64> {
        let size = fs::metadata(source)
            .await
            .context(IoSnafu { path: source })?
            .len();

        self.ensure_staging_area(name).await?;
        let target = self.layout.chunk_path(name, index);
        if fs::rename(source, &target).await.is_err() {
            let incoming = self.layout.incoming_path();
            let mut file = File::open(source)
                .await
                .context(IoSnafu { path: source })?;
            if let Err(e) = self.write_incoming(&incoming, &mut file).await {
                discard(&incoming).await;
                return Err(e);
            }
            if let Err(e) = self.place(name, index, &incoming).await {
                discard(&incoming).await;
                return Err(e);
            }
            if let Err(e) = fs::remove_file(source).await {
                warn!(path = %source.display(), error = %e, "Failed to remove chunk source");
            }
        }

        debug!(name, index, size, "Staged chunk from file");
        Ok(size)
    }

    async fn write_incoming<R>(&self, incoming: &Path, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let dir = self.layout.incoming_dir();
        fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: dir })?;

        let file = File::create(incoming)
            .await
            .context(IoSnafu { path: incoming })?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        let written = tokio::io::copy(reader, &mut writer)
            .await
            .context(IoSnafu { path: incoming })?;

        writer.flush().await.context(IoSnafu { path: incoming })?;
        if self.sync_writes {
            writer
                .get_mut()
                .sync_all()
                .await
                .context(IoSnafu { path: incoming })?;
        }
        Ok(written)
    }

    async fn place(&self, name: &str, index: u64, incoming: &Path) -> Result<()> {
        self.ensure_staging_area(name).await?;
        let target = self.layout.chunk_path(name, index);
        fs::rename(incoming, &target)
            .await
            .context(IoSnafu { path: target })
    }

    /// Whether a staging area exists for `name`.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let dir = self.layout.staging_dir(name);
        fs::try_exists(&dir).await.context(IoSnafu { path: dir })
    }

    /// Remove the staging area of `name` and every chunk in it.
    pub async fn remove_staging_area(&self, name: &str) -> Result<()> {
        let dir = self.layout.staging_dir(name);
        match fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context(IoSnafu { path: dir }),
            _ => Ok(()),
        }
    }

    /// Drop upload buffers left behind by interrupted uploads.
    pub async fn clear_incoming(&self) -> Result<usize> {
        let dir = self.layout.incoming_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context(IoSnafu { path: dir }),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { path: dir.clone() })?
        {
            let path = entry.path();
            fs::remove_file(&path)
                .await
                .context(IoSnafu { path: path.clone() })?;
            removed += 1;
        }
        Ok(removed)
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to discard upload buffer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ChunkStore { ChunkStore::new(Layout::new(dir), 4096, false) }

    #[tokio::test]
    async fn test_put_places_chunk_and_leaves_no_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(!store.exists("f").await.unwrap());
        assert_eq!(store.put("f", 2, b"hello").await.unwrap(), 5);
        assert!(store.exists("f").await.unwrap());

        let staged = fs::read(store.layout().chunk_path("f", 2)).await.unwrap();
        assert_eq!(staged, b"hello");
        assert_eq!(store.clear_incoming().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reupload_replaces_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store.put("f", 0, b"first version").await.unwrap();
        store.put("f", 0, b"second").await.unwrap();
        let staged = fs::read(store.layout().chunk_path("f", 0)).await.unwrap();
        assert_eq!(staged, b"second");
    }

    #[tokio::test]
    async fn test_put_file_moves_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let source = dir.path().join("upload.tmp");
        fs::write(&source, b"chunk").await.unwrap();

        assert_eq!(store.put_file("f", 1, &source).await.unwrap(), 5);
        assert!(!source.exists());
        let staged = fs::read(store.layout().chunk_path("f", 1)).await.unwrap();
        assert_eq!(staged, b"chunk");
    }

    #[tokio::test]
    async fn test_remove_staging_area_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put("f", 0, b"x").await.unwrap();

        store.remove_staging_area("f").await.unwrap();
        assert!(!store.exists("f").await.unwrap());
        store.remove_staging_area("f").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_incoming_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let layout = store.layout().clone();
        fs::create_dir_all(layout.incoming_dir()).await.unwrap();
        fs::write(layout.incoming_path(), b"partial").await.unwrap();
        fs::write(layout.incoming_path(), b"partial").await.unwrap();

        assert_eq!(store.clear_incoming().await.unwrap(), 2);
        assert_eq!(store.clear_incoming().await.unwrap(), 0);
    }
}
