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

use std::{collections::HashMap, io::ErrorKind};

use jiff::{SignedDuration, Timestamp};
use parking_lot::Mutex;
use snafu::{ResultExt, ensure};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    error::{
        AbortInProgressSnafu, ChunkCountUnknownSnafu, InvalidArgumentSnafu, IoSnafu,
        MergeInProgressSnafu, Result, SessionCorruptedSnafu, SessionNotFoundSnafu,
        SessionStateSnafu, StagingNotFoundSnafu, UploadsInFlightSnafu,
    },
    path::Layout,
    types::{SessionSpec, SessionState, UploadSession},
};

struct Entry {
    session:   UploadSession,
    /// Uploads holding an [`UploadPermit`]
    in_flight: u32,
    /// An [`AbortGuard`] is deleting the staging area
    aborting:  bool,
}

impl Entry {
    const fn new(session: UploadSession) -> Self {
        Self {
            session,
            in_flight: 0,
            aborting: false,
        }
    }
}

fn implicit_session(name: &str, now: i64) -> UploadSession {
    UploadSession {
        name:            name.to_string(),
        expected_chunks: None,
        expected_size:   None,
        sha256:          None,
        state:           SessionState::Pending,
        created_at:      now,
        updated_at:      now,
    }
}

/// Owns every upload session and serializes their state transitions.
///
/// All transitions happen under one lock, which is what gives per-name
/// mutual exclusion between uploads and merges. Records are persisted
/// separately through [`SessionManager::persist`], which always writes the
/// latest in-memory state.
pub struct SessionManager {
    layout:   Layout,
    sessions: Mutex<HashMap<String, Entry>>,
    persist:  tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            sessions: Mutex::new(HashMap::new()),
            persist: tokio::sync::Mutex::new(()),
        }
    }

    /// Load persisted session records.
    ///
    /// A record left in `Merging` belongs to a merge that never finished; it
    /// is returned to `Complete` so the merge can be retried. Unreadable
    /// records are skipped.
    pub async fn recover(layout: Layout) -> Result<Self> {
        let manager = Self::new(layout);
        let dir = manager.layout.session_dir();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(manager),
            Err(e) => return Err(e).context(IoSnafu { path: dir }),
        };

        let mut recovered = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { path: dir.clone() })?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::load(&path).await {
                Ok(mut session) => {
                    if let SessionState::Merging { chunk_count } = session.state {
                        warn!(name = %session.name, "Reverting interrupted merge");
                        session.state = SessionState::Complete { chunk_count };
                        recovered.push(session.name.clone());
                    }
                    manager
                        .sessions
                        .lock()
                        .insert(session.name.clone(), Entry::new(session));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session"),
            }
        }

        for name in recovered {
            manager.persist(&name).await?;
        }

        info!(
            sessions = manager.sessions.lock().len(),
            "Recovered upload sessions"
        );
        Ok(manager)
    }

    async fn load(path: &std::path::Path) -> Result<UploadSession> {
        let raw = fs::read_to_string(path)
            .await
            .context(IoSnafu { path })?;
        serde_json::from_str(&raw).context(SessionCorruptedSnafu { path })
    }

    pub fn get(&self, name: &str) -> Option<UploadSession> {
        self.sessions
            .lock()
            .get(name)
            .map(|entry| entry.session.clone())
    }

    /// Names of every known session.
    pub fn names(&self) -> Vec<String> { self.sessions.lock().keys().cloned().collect() }

    /// Start a new session, replacing a merged or still-empty one.
    pub fn begin(&self, name: &str, spec: SessionSpec) -> Result<UploadSession> {
        ensure!(
            spec.expected_chunks != Some(0),
            InvalidArgumentSnafu {
                name,
                reason: "expected chunk count must be positive",
            }
        );

        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(name) {
            ensure!(!existing.aborting, AbortInProgressSnafu { name });
            ensure!(
                matches!(
                    existing.session.state,
                    SessionState::Pending | SessionState::Merged { .. }
                ) && existing.in_flight == 0,
                SessionStateSnafu {
                    name,
                    state: existing.session.state,
                    action: "begin a new session",
                }
            );
        }

        let now = Timestamp::now().as_second();
        let session = UploadSession {
            name: name.to_string(),
            expected_chunks: spec.expected_chunks,
            expected_size: spec.expected_size,
            sha256: spec.sha256.map(|s| s.to_lowercase()),
            state: SessionState::Pending,
            created_at: now,
            updated_at: now,
        };
        sessions.insert(name.to_string(), Entry::new(session.clone()));
        Ok(session)
    }

    /// Admit one chunk upload.
    ///
    /// A name without a session gets an implicit one whose chunk count is
    /// declared later through [`SessionManager::complete`]. The returned flag
    /// reports whether the session changed state and needs persisting.
    pub fn start_upload(&self, name: &str, index: u64) -> Result<(UploadPermit<'_>, bool)> {
        let mut sessions = self.sessions.lock();
        let now = Timestamp::now().as_second();
        let entry = sessions
            .entry(name.to_string())
            .or_insert_with(|| Entry::new(implicit_session(name, now)));
        ensure!(!entry.aborting, AbortInProgressSnafu { name });

        let state = entry.session.state;
        ensure!(
            !matches!(state, SessionState::Merging { .. }),
            MergeInProgressSnafu { name }
        );
        ensure!(
            state.accepts_chunks(),
            SessionStateSnafu {
                name,
                state,
                action: "accept chunks",
            }
        );
        if let Some(count) = entry.session.chunk_count() {
            ensure!(
                index < count,
                InvalidArgumentSnafu {
                    name,
                    reason: format!("chunk index {index} is outside 0..{count}"),
                }
            );
        }

        let transitioned = state == SessionState::Pending;
        if transitioned {
            entry.session.state = SessionState::Receiving;
            entry.session.updated_at = now;
        }
        entry.in_flight += 1;

        Ok((
            UploadPermit {
                manager: self,
                name:    name.to_string(),
            },
            transitioned,
        ))
    }

    /// Declare the final chunk count of a session.
    pub fn complete(&self, name: &str, chunk_count: u64) -> Result<UploadSession> {
        ensure!(
            chunk_count > 0,
            InvalidArgumentSnafu {
                name,
                reason: "chunk count must be positive",
            }
        );

        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(name)
            .ok_or_else(|| SessionNotFoundSnafu { name }.build())?;
        ensure!(!entry.aborting, AbortInProgressSnafu { name });
        let state = entry.session.state;
        ensure!(
            !matches!(state, SessionState::Merging { .. }),
            MergeInProgressSnafu { name }
        );
        ensure!(
            state.accepts_chunks(),
            SessionStateSnafu {
                name,
                state,
                action: "be completed",
            }
        );
        if let Some(expected) = entry.session.expected_chunks {
            ensure!(
                expected == chunk_count,
                InvalidArgumentSnafu {
                    name,
                    reason: format!(
                        "chunk count {chunk_count} differs from the {expected} declared at begin"
                    ),
                }
            );
        }

        entry.session.state = SessionState::Complete { chunk_count };
        entry.session.updated_at = Timestamp::now().as_second();
        Ok(entry.session.clone())
    }

    /// Move a session into `Merging`.
    ///
    /// Fails when another merge runs, when uploads are still in flight, or
    /// when the chunk count is not known yet.
    pub fn begin_merge(&self, name: &str) -> Result<MergeGuard<'_>> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(name)
            .ok_or_else(|| StagingNotFoundSnafu { name }.build())?;
        ensure!(!entry.aborting, AbortInProgressSnafu { name });

        let previous = entry.session.state;
        match previous {
            SessionState::Merged { .. } => return StagingNotFoundSnafu { name }.fail(),
            SessionState::Merging { .. } => return MergeInProgressSnafu { name }.fail(),
            _ => {}
        }
        ensure!(
            entry.in_flight == 0,
            UploadsInFlightSnafu {
                name,
                count: entry.in_flight,
            }
        );
        let chunk_count = entry
            .session
            .chunk_count()
            .ok_or_else(|| ChunkCountUnknownSnafu { name }.build())?;

        entry.session.state = SessionState::Merging { chunk_count };
        entry.session.updated_at = Timestamp::now().as_second();

        Ok(MergeGuard {
            manager: self,
            name: name.to_string(),
            session: entry.session.clone(),
            previous,
            finished: false,
        })
    }

    /// Claim `name` for an abort.
    ///
    /// Until the returned guard is finished or dropped, every upload, merge
    /// and new session for `name` is refused. A name without a session is
    /// claimed too, so chunks staged without one can be aborted safely.
    pub fn begin_abort(&self, name: &str) -> Result<AbortGuard<'_>> {
        let mut sessions = self.sessions.lock();
        let known = match sessions.get_mut(name) {
            Some(entry) => {
                ensure!(!entry.aborting, AbortInProgressSnafu { name });
                ensure!(
                    !matches!(entry.session.state, SessionState::Merging { .. }),
                    MergeInProgressSnafu { name }
                );
                ensure!(
                    entry.in_flight == 0,
                    UploadsInFlightSnafu {
                        name,
                        count: entry.in_flight,
                    }
                );
                entry.aborting = true;
                true
            }
            None => {
                let mut entry = Entry::new(implicit_session(name, Timestamp::now().as_second()));
                entry.aborting = true;
                sessions.insert(name.to_string(), entry);
                false
            }
        };

        Ok(AbortGuard {
            manager: self,
            name: name.to_string(),
            known,
            finished: false,
        })
    }

    /// Forget merged sessions whose last transition is older than `ttl` and
    /// delete their records. Returns the evicted names.
    pub async fn evict_merged(&self, ttl: SignedDuration) -> Result<Vec<String>> {
        let cutoff = Timestamp::now().as_second().saturating_sub(ttl.as_secs());
        let evicted: Vec<String> = {
            let mut sessions = self.sessions.lock();
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry.session.state, SessionState::Merged { .. })
                        && !entry.aborting
                        && entry.session.updated_at <= cutoff
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in &expired {
                sessions.remove(name);
            }
            expired
        };

        for name in &evicted {
            self.persist(name).await?;
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted merged sessions");
        }
        Ok(evicted)
    }

    /// Write the current record of `name` to disk, or delete the record when
    /// the session no longer exists.
    pub async fn persist(&self, name: &str) -> Result<()> {
        let _serialized = self.persist.lock().await;
        let path = self.layout.session_path(name);

        let Some(session) = self.get(name) else {
            return match fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e).context(IoSnafu { path }),
                _ => Ok(()),
            };
        };

        let dir = self.layout.session_dir();
        fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: dir })?;

        let raw = serde_json::to_string_pretty(&session).context(SessionCorruptedSnafu {
            path: path.clone(),
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .await
            .context(IoSnafu { path: tmp.clone() })?;
        fs::rename(&tmp, &path)
            .await
            .context(IoSnafu { path: path.clone() })?;

        debug!(name, state = %session.state, "Persisted session");
        Ok(())
    }

    fn release_upload(&self, name: &str) {
        if let Some(entry) = self.sessions.lock().get_mut(name) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    fn finish_abort(&self, name: &str, known: bool, completed: bool) {
        let mut sessions = self.sessions.lock();
        if completed || !known {
            if sessions.get(name).is_some_and(|entry| entry.aborting) {
                sessions.remove(name);
            }
        } else if let Some(entry) = sessions.get_mut(name) {
            entry.aborting = false;
        }
    }

    fn finish_merge(&self, name: &str, state: SessionState) {
        if let Some(entry) = self.sessions.lock().get_mut(name) {
            entry.session.state = state;
            entry.session.updated_at = Timestamp::now().as_second();
        }
    }
}

/// Marks one upload as in flight until dropped.
pub struct UploadPermit<'a> {
    manager: &'a SessionManager,
    name:    String,
}

impl Drop for UploadPermit<'_> {
    fn drop(&mut self) { self.manager.release_upload(&self.name); }
}

/// Exclusive right to merge one session.
///
/// Dropping the guard without [`MergeGuard::commit`] returns the session to
/// the state it was in before the merge, so a failed or cancelled merge can
/// be retried.
pub struct MergeGuard<'a> {
    manager:  &'a SessionManager,
    name:     String,
    session:  UploadSession,
    previous: SessionState,
    finished: bool,
}

impl MergeGuard<'_> {
    /// The session as it was when the merge started
    pub const fn session(&self) -> &UploadSession { &self.session }

    pub fn chunk_count(&self) -> u64 { self.session.chunk_count().unwrap_or_default() }

    /// Mark the session merged.
    pub fn commit(mut self, size: u64) {
        self.manager
            .finish_merge(&self.name, SessionState::Merged { size });
        self.finished = true;
    }
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.finish_merge(&self.name, self.previous);
        }
    }
}

/// Exclusive right to abort one name.
///
/// [`AbortGuard::finish`] forgets the session. Dropping the guard unfinished
/// leaves the session as it was.
pub struct AbortGuard<'a> {
    manager:  &'a SessionManager,
    name:     String,
    known:    bool,
    finished: bool,
}

impl AbortGuard<'_> {
    /// Whether a session existed when the abort started
    pub const fn known(&self) -> bool { self.known }

    pub fn finish(mut self) {
        self.manager.finish_abort(&self.name, self.known, true);
        self.finished = true;
    }
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.finish_abort(&self.name, self.known, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StagingError;

    fn manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(Layout::new(dir.path()));
        (dir, manager)
    }

    fn spec(chunks: u64) -> SessionSpec {
        SessionSpec {
            expected_chunks: Some(chunks),
            ..SessionSpec::default()
        }
    }

    #[test]
    fn test_state_machine_happy_path() {
        let (_dir, manager) = manager();
        let session = manager.begin("f", spec(2)).unwrap();
        assert_eq!(session.state, SessionState::Pending);

        let (permit, transitioned) = manager.start_upload("f", 0).unwrap();
        assert!(transitioned);
        drop(permit);
        assert_eq!(manager.get("f").unwrap().state, SessionState::Receiving);

        let (permit, transitioned) = manager.start_upload("f", 1).unwrap();
        assert!(!transitioned);
        drop(permit);

        let session = manager.complete("f", 2).unwrap();
        assert_eq!(session.state, SessionState::Complete { chunk_count: 2 });

        let guard = manager.begin_merge("f").unwrap();
        assert_eq!(guard.chunk_count(), 2);
        assert_eq!(
            manager.get("f").unwrap().state,
            SessionState::Merging { chunk_count: 2 }
        );
        guard.commit(10);
        assert_eq!(
            manager.get("f").unwrap().state,
            SessionState::Merged { size: 10 }
        );
    }

    #[test]
    fn test_merge_blocked_while_upload_in_flight() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(1)).unwrap();
        let (permit, _) = manager.start_upload("f", 0).unwrap();

        assert!(matches!(
            manager.begin_merge("f"),
            Err(StagingError::UploadsInFlight { count: 1, .. })
        ));
        drop(permit);
        assert!(manager.begin_merge("f").is_ok());
    }

    #[test]
    fn test_single_merge_per_name() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(1)).unwrap();
        let _guard = manager.begin_merge("f").unwrap();
        assert!(matches!(
            manager.begin_merge("f"),
            Err(StagingError::MergeInProgress { .. })
        ));
        assert!(matches!(
            manager.start_upload("f", 0),
            Err(StagingError::MergeInProgress { .. })
        ));
    }

    #[test]
    fn test_dropped_merge_guard_restores_state() {
        let (_dir, manager) = manager();
        manager.begin("f", SessionSpec::default()).unwrap();
        drop(manager.start_upload("f", 3).unwrap());
        manager.complete("f", 4).unwrap();

        drop(manager.begin_merge("f").unwrap());
        assert_eq!(
            manager.get("f").unwrap().state,
            SessionState::Complete { chunk_count: 4 }
        );
    }

    #[test]
    fn test_rejects_late_chunks_after_merge() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(1)).unwrap();
        manager.begin_merge("f").unwrap().commit(4);

        assert!(matches!(
            manager.start_upload("f", 0),
            Err(StagingError::SessionState { .. })
        ));
        assert!(matches!(
            manager.begin_merge("f"),
            Err(StagingError::StagingNotFound { .. })
        ));
        // a fresh session may reuse the name
        manager.begin("f", spec(1)).unwrap();
        assert!(manager.start_upload("f", 0).is_ok());
    }

    #[test]
    fn test_index_bounds_and_unknown_count() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(3)).unwrap();
        assert!(matches!(
            manager.start_upload("f", 3),
            Err(StagingError::InvalidArgument { .. })
        ));

        drop(manager.start_upload("g", 5).unwrap());
        assert!(matches!(
            manager.begin_merge("g"),
            Err(StagingError::ChunkCountUnknown { .. })
        ));
        assert!(matches!(
            manager.complete("g", 0),
            Err(StagingError::InvalidArgument { .. })
        ));
        assert!(matches!(
            manager.begin_merge("missing"),
            Err(StagingError::StagingNotFound { .. })
        ));
    }

    #[test]
    fn test_begin_rejects_active_session() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(2)).unwrap();
        drop(manager.start_upload("f", 0).unwrap());
        assert!(matches!(
            manager.begin("f", spec(2)),
            Err(StagingError::SessionState { .. })
        ));
        manager.begin_abort("f").unwrap().finish();
        manager.begin("f", spec(2)).unwrap();
    }

    #[test]
    fn test_abort_refuses_everything_until_finished() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(2)).unwrap();
        drop(manager.start_upload("f", 0).unwrap());

        let guard = manager.begin_abort("f").unwrap();
        assert!(guard.known());
        assert!(matches!(
            manager.start_upload("f", 1),
            Err(StagingError::AbortInProgress { .. })
        ));
        assert!(matches!(
            manager.complete("f", 2),
            Err(StagingError::AbortInProgress { .. })
        ));
        assert!(matches!(
            manager.begin_merge("f"),
            Err(StagingError::AbortInProgress { .. })
        ));
        assert!(matches!(
            manager.begin("f", spec(1)),
            Err(StagingError::AbortInProgress { .. })
        ));
        assert!(matches!(
            manager.begin_abort("f"),
            Err(StagingError::AbortInProgress { .. })
        ));

        guard.finish();
        assert!(manager.get("f").is_none());
        let (_permit, transitioned) = manager.start_upload("f", 0).unwrap();
        assert!(transitioned);
    }

    #[test]
    fn test_abort_without_session_claims_the_name() {
        let (_dir, manager) = manager();
        let guard = manager.begin_abort("g").unwrap();
        assert!(!guard.known());
        assert!(matches!(
            manager.start_upload("g", 0),
            Err(StagingError::AbortInProgress { .. })
        ));

        drop(guard);
        assert!(manager.get("g").is_none());
        assert!(manager.start_upload("g", 0).is_ok());
    }

    #[test]
    fn test_dropped_abort_guard_keeps_session() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(1)).unwrap();
        drop(manager.begin_abort("f").unwrap());
        assert_eq!(manager.get("f").unwrap().state, SessionState::Pending);
        assert!(manager.start_upload("f", 0).is_ok());
    }

    #[test]
    fn test_abort_refused_while_busy() {
        let (_dir, manager) = manager();
        manager.begin("f", spec(1)).unwrap();
        let (permit, _) = manager.start_upload("f", 0).unwrap();
        assert!(matches!(
            manager.begin_abort("f"),
            Err(StagingError::UploadsInFlight { .. })
        ));
        drop(permit);

        let _merge = manager.begin_merge("f").unwrap();
        assert!(matches!(
            manager.begin_abort("f"),
            Err(StagingError::MergeInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_evict_merged_sessions() {
        let (dir, manager) = manager();
        manager.begin("old", spec(1)).unwrap();
        manager.begin_merge("old").unwrap().commit(1);
        manager.persist("old").await.unwrap();
        manager.begin("active", spec(1)).unwrap();
        manager.persist("active").await.unwrap();

        let kept = manager
            .evict_merged(SignedDuration::from_hours(1))
            .await
            .unwrap();
        assert!(kept.is_empty());
        assert!(manager.get("old").is_some());

        let evicted = manager.evict_merged(SignedDuration::ZERO).await.unwrap();
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(manager.get("old").is_none());
        assert!(manager.get("active").is_some());
        let layout = Layout::new(dir.path());
        assert!(!layout.session_path("old").exists());
        assert!(layout.session_path("active").exists());
    }

    #[tokio::test]
    async fn test_persist_and_recover() {
        let (dir, manager) = manager();
        manager
            .begin("f", SessionSpec {
                expected_chunks: Some(2),
                expected_size:   Some(8),
                sha256:          Some("ABCDEF".to_string()),
            })
            .unwrap();
        manager.persist("f").await.unwrap();
        let guard = manager.begin_merge("f").unwrap();
        manager.persist("f").await.unwrap();
        std::mem::forget(guard);

        let recovered = SessionManager::recover(Layout::new(dir.path()))
            .await
            .unwrap();
        let session = recovered.get("f").unwrap();
        assert_eq!(session.state, SessionState::Complete { chunk_count: 2 });
        assert_eq!(session.expected_size, Some(8));
        assert_eq!(session.sha256.as_deref(), Some("abcdef"));

        recovered.begin_abort("f").unwrap().finish();
        recovered.persist("f").await.unwrap();
        assert!(!Layout::new(dir.path()).session_path("f").exists());
    }
}
