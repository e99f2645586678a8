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

use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, BufReader},
};
use tracing::warn;

use crate::{
    error::{IoSnafu, Result},
    path::{Layout, PARTIAL_PREFIX},
};

/// Merge output that is not visible under the artifact name yet.
///
/// The file is removed on drop unless [`PartialArtifact::persist`] moved it
/// into place, so an aborted merge never leaves a truncated artifact behind.
#[derive(Debug)]
pub struct PartialArtifact {
    path:      PathBuf,
    target:    PathBuf,
    persisted: bool,
}

impl PartialArtifact {
    pub async fn create(layout: &Layout, name: &str) -> Result<(Self, File)> {
        let dir = layout.artifact_dir();
        fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: dir })?;

        let path = layout.partial_artifact_path(name);
        let file = File::create(&path)
            .await
            .context(IoSnafu { path: path.clone() })?;
        Ok((
            Self {
                path,
                target: layout.artifact_path(name),
                persisted: false,
            },
            file,
        ))
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Atomically replace the artifact with this file.
    pub async fn persist(mut self) -> Result<PathBuf> {
        fs::rename(&self.path, &self.target)
            .await
            .context(IoSnafu {
                path: self.target.clone(),
            })?;
        self.persisted = true;

        #[cfg(unix)]
        if let Some(parent) = self.target.parent() {
            let dir = File::open(parent)
                .await
                .context(IoSnafu { path: parent })?;
            dir.sync_all().await.context(IoSnafu { path: parent })?;
        }

        Ok(self.target.clone())
    }
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove partial artifact");
        }
    }
}

/// Remove merge output abandoned by a crash.
pub async fn remove_partials(layout: &Layout) -> Result<usize> {
    let dir = layout.artifact_dir();
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
        if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
            let path = entry.path();
            fs::remove_file(&path)
                .await
                .context(IoSnafu { path: path.clone() })?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// SHA256 of a file as lowercase hex.
pub async fn sha256_file(path: &Path, buffer_size: usize) -> Result<String> {
    let file = File::open(path).await.context(IoSnafu { path })?;
    let mut reader = BufReader::with_capacity(buffer_size, file);
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut hasher = Sha256::new();

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .context(IoSnafu { path })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persist_replaces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.artifact_dir()).await.unwrap();
        fs::write(layout.artifact_path("f"), b"old").await.unwrap();

        let (partial, _file) = PartialArtifact::create(&layout, "f").await.unwrap();
        fs::write(partial.path(), b"new").await.unwrap();
        let partial_path = partial.path().to_path_buf();

        let path = partial.persist().await.unwrap();
        assert_eq!(path, layout.artifact_path("f"));
        assert_eq!(fs::read(&path).await.unwrap(), b"new");
        assert!(!partial_path.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());

        let (partial, file) = PartialArtifact::create(&layout, "f").await.unwrap();
        drop(file);
        let partial_path = partial.path().to_path_buf();
        assert!(partial_path.exists());

        drop(partial);
        assert!(!partial_path.exists());
        assert!(!layout.artifact_path("f").exists());
    }

    #[tokio::test]
    async fn test_remove_partials_keeps_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.artifact_dir()).await.unwrap();
        fs::write(layout.artifact_path("done"), b"x").await.unwrap();
        fs::write(layout.partial_artifact_path("f"), b"y")
            .await
            .unwrap();

        assert_eq!(remove_partials(&layout).await.unwrap(), 1);
        assert!(layout.artifact_path("done").exists());
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            sha256_file(&path, 2).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
