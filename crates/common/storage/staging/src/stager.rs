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

use std::path::Path;

use jiff::Timestamp;
use snafu::{ResultExt, ensure};
use tokio::{fs, io::AsyncRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    artifact::remove_partials,
    buffered_merger::{BufferedMerger, WrittenArtifact},
    config::StagingConfig,
    enumerator::{ChunkEnumerator, ensure_complete},
    error::{
        CancelledSnafu, IoSnafu, Result, Sha256MismatchSnafu, SessionNotFoundSnafu,
        SizeMismatchSnafu,
    },
    lock::RootLock,
    path::{Layout, validate_name},
    range_reader::{RangeReader, RangeStream},
    session::{MergeGuard, SessionManager},
    store::ChunkStore,
    streamed_merger::StreamedMerger,
    types::{
        Artifact, ArtifactStat, ChunkEntry, MergeStrategy, SessionSpec, SessionState,
        UploadSession,
    },
};

const MIN_IO_BUFFER: usize = 8 * 1024;

/// Entry point of the staging engine.
///
/// Validates names, drives the session state machine and dispatches to the
/// chunk store, the mergers and the range reader. One `Stager` owns one
/// staging root, locked against any other owner until it is dropped; share
/// it behind an `Arc`.
pub struct Stager {
    config:     StagingConfig,
    layout:     Layout,
    store:      ChunkStore,
    enumerator: ChunkEnumerator,
    sessions:   SessionManager,
    buffered:   BufferedMerger,
    streamed:   StreamedMerger,
    ranges:     RangeReader,
    _lock:      RootLock,
}

impl Stager {
    /// Open the staging root, creating it if needed, and recover the state
    /// an earlier process left behind.
    pub async fn open(config: StagingConfig) -> Result<Self> {
        let layout = Layout::new(&config.root_dir);
        for dir in layout.directories() {
            fs::create_dir_all(&dir)
                .await
                .context(IoSnafu { path: &dir })?;
        }
        let lock = RootLock::acquire(&layout)?;

        let buffer_size = config.io_buffer_size.as_usize().max(MIN_IO_BUFFER);
        let store = ChunkStore::new(layout.clone(), buffer_size, config.sync_writes);
        let buffers = store.clear_incoming().await?;
        let partials = remove_partials(&layout).await?;
        let sessions = SessionManager::recover(layout.clone()).await?;

        for name in sessions.names() {
            let merged = sessions
                .get(&name)
                .is_some_and(|s| matches!(s.state, SessionState::Merged { .. }));
            if merged && let Err(e) = store.remove_staging_area(&name).await {
                warn!(name, error = %e, "Failed to remove leftover staging area");
            }
        }
        let evicted = sessions.evict_merged(config.merged_session_ttl).await?;

        info!(
            root = %layout.root().display(),
            buffers,
            partials,
            evicted = evicted.len(),
            "Staging root opened"
        );

        Ok(Self {
            enumerator: ChunkEnumerator::new(layout.clone()),
            buffered: BufferedMerger::new(
                layout.clone(),
                config.buffered_merge_limit,
                config.sync_writes,
            ),
            streamed: StreamedMerger::new(
                layout.clone(),
                config.merge_concurrency,
                buffer_size,
                config.sync_writes,
            ),
            ranges: RangeReader::new(layout.clone(), buffer_size),
            store,
            sessions,
            layout,
            config,
            _lock: lock,
        })
    }

    pub const fn config(&self) -> &StagingConfig { &self.config }

    pub const fn layout(&self) -> &Layout { &self.layout }

    /// Begin an upload session, recording what the client promises to send.
    pub async fn begin(&self, name: &str, spec: SessionSpec) -> Result<UploadSession> {
        validate_name(name)?;
        let session = self.sessions.begin(name, spec)?;
        self.sessions.persist(name).await?;
        info!(
            name,
            expected_chunks = ?session.expected_chunks,
            expected_size = ?session.expected_size,
            "Upload session started"
        );
        Ok(session)
    }

    /// Stage one chunk held in memory.
    pub async fn put(&self, name: &str, index: u64, bytes: &[u8]) -> Result<u64> {
        let mut reader = bytes;
        self.put_reader(name, index, &mut reader).await
    }

    /// Stage one chunk read from `reader`. Returns the chunk size.
    pub async fn put_reader<R>(&self, name: &str, index: u64, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        validate_name(name)?;
        let (permit, transitioned) = self.sessions.start_upload(name, index)?;
        if transitioned {
            self.sessions.persist(name).await?;
        }
        let size = self.store.put_reader(name, index, reader).await?;
        drop(permit);
        Ok(size)
    }

    /// Stage one chunk already written to `source`, taking ownership of the
    /// file.
    pub async fn put_file(&self, name: &str, index: u64, source: &Path) -> Result<u64> {
        validate_name(name)?;
        let (permit, transitioned) = self.sessions.start_upload(name, index)?;
        if transitioned {
            self.sessions.persist(name).await?;
        }
        let size = self.store.put_file(name, index, source).await?;
        drop(permit);
        Ok(size)
    }

    /// Declare how many chunks make up the artifact.
    pub async fn complete(&self, name: &str, chunk_count: u64) -> Result<UploadSession> {
        validate_name(name)?;
        let session = self.sessions.complete(name, chunk_count)?;
        self.sessions.persist(name).await?;
        debug!(name, chunk_count, "Upload declared complete");
        Ok(session)
    }

    pub fn session(&self, name: &str) -> Result<UploadSession> {
        validate_name(name)?;
        self.sessions
            .get(name)
            .ok_or_else(|| SessionNotFoundSnafu { name }.build())
    }

    /// Chunks currently staged for `name`, ascending by index.
    pub async fn list_chunks(&self, name: &str) -> Result<Vec<ChunkEntry>> {
        validate_name(name)?;
        self.enumerator.list(name).await
    }

    /// Merge in memory. Refused above the buffered merge limit.
    pub async fn merge(&self, name: &str) -> Result<Artifact> {
        self.merge_with(name, MergeStrategy::Buffered, &CancellationToken::new())
            .await
    }

    /// Merge with memory bounded by the I/O buffer size.
    pub async fn merge_streamed(&self, name: &str) -> Result<Artifact> {
        self.merge_with(name, MergeStrategy::Streamed, &CancellationToken::new())
            .await
    }

    /// Reassemble the artifact of `name` from its staged chunks.
    ///
    /// The artifact becomes visible atomically and only once complete. The
    /// staging area is removed after that; on any failure, including
    /// cancellation through `cancel`, it is left untouched and the session
    /// returns to its pre-merge state so the merge can be retried.
    pub async fn merge_with(
        &self,
        name: &str,
        strategy: MergeStrategy,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        validate_name(name)?;
        let guard = self.sessions.begin_merge(name)?;
        if let Err(e) = self.sessions.persist(name).await {
            drop(guard);
            return Err(e);
        }

        let outcome = self.merge_locked(name, strategy, cancel, &guard).await;
        match &outcome {
            Ok(artifact) => guard.commit(artifact.size),
            Err(e) => {
                warn!(name, error = %e, "Merge failed, staging area kept");
                drop(guard);
            }
        }
        if let Err(e) = self.sessions.persist(name).await {
            warn!(name, error = %e, "Failed to persist session after merge");
        }

        let artifact = outcome?;
        if let Err(e) = self.store.remove_staging_area(name).await {
            warn!(name, error = %e, "Failed to remove staging area of merged artifact");
        }
        if let Err(e) = self
            .sessions
            .evict_merged(self.config.merged_session_ttl)
            .await
        {
            warn!(error = %e, "Failed to evict merged sessions");
        }
        info!(
            name,
            size = artifact.size,
            chunks = artifact.chunk_count,
            strategy = %artifact.strategy,
            duration = ?artifact.duration,
            "Artifact merged"
        );
        Ok(artifact)
    }

    async fn merge_locked(
        &self,
        name: &str,
        strategy: MergeStrategy,
        cancel: &CancellationToken,
        guard: &MergeGuard<'_>,
    ) -> Result<Artifact> {
        let start = Timestamp::now();
        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => CancelledSnafu { name }.fail(),
            written = self.write_artifact(name, strategy, guard.session()) => written,
        };
        let (written, chunk_count, strategy) = written?;

        let sha256 = written.sha256;
        let size = written.size;
        let path = written.partial.persist().await?;

        Ok(Artifact {
            name: name.to_string(),
            path,
            size,
            sha256,
            chunk_count,
            strategy,
            duration: start.until(Timestamp::now()).unwrap_or_default(),
        })
    }

    async fn write_artifact(
        &self,
        name: &str,
        strategy: MergeStrategy,
        session: &UploadSession,
    ) -> Result<(WrittenArtifact, u64, MergeStrategy)> {
        let chunk_count = session.chunk_count().unwrap_or_default();
        let chunks = self.enumerator.list(name).await?;
        ensure_complete(name, chunk_count, &chunks)?;

        let total: u64 = chunks.iter().map(|chunk| chunk.size).sum();
        if let Some(expected) = session.expected_size {
            ensure!(
                expected == total,
                SizeMismatchSnafu {
                    name,
                    expected,
                    actual: total,
                }
            );
        }

        let strategy = self.config.resolve_strategy(strategy, total);
        debug!(name, chunk_count, total, %strategy, "Merging chunks");
        let written = match strategy {
            MergeStrategy::Buffered => self.buffered.write(name, &chunks).await?,
            MergeStrategy::Streamed | MergeStrategy::Auto => {
                self.streamed
                    .write(name, &chunks, session.sha256.is_some())
                    .await?
            }
        };

        if let Some(expected) = &session.sha256 {
            let actual = written.sha256.clone().unwrap_or_default();
            ensure!(
                &actual == expected,
                Sha256MismatchSnafu {
                    name,
                    expected: expected.clone(),
                    actual,
                }
            );
        }

        Ok((written, chunk_count, strategy))
    }

    /// Abandon the upload of `name`: forget its session and delete every
    /// staged chunk. A merged artifact is kept.
    pub async fn abort(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let guard = self.sessions.begin_abort(name)?;
        let staged = self.store.exists(name).await?;
        ensure!(guard.known() || staged, SessionNotFoundSnafu { name });

        self.store.remove_staging_area(name).await?;
        guard.finish();
        self.sessions.persist(name).await?;
        info!(name, "Upload aborted");
        Ok(())
    }

    pub async fn stat(&self, name: &str) -> Result<ArtifactStat> {
        validate_name(name)?;
        self.ranges.stat(name).await
    }

    /// Inclusive byte range `start..=end` of a merged artifact.
    pub async fn read_range(&self, name: &str, start: u64, end: u64) -> Result<RangeStream> {
        validate_name(name)?;
        self.ranges.read_range(name, start, end).await
    }
}
