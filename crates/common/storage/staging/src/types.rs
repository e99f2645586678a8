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

use std::path::PathBuf;

use bon::Builder;
use jiff::Span;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// One staged chunk as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Position of the chunk in the reassembled artifact (0-based)
    pub index: u64,
    /// Size of the staged chunk in bytes
    pub size:  u64,
    /// Location of the staged chunk
    pub path:  PathBuf,
}

/// How a merge reconstructs the artifact
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MergeStrategy {
    /// Load every chunk into memory and write the artifact in one write
    Buffered,
    /// Copy each chunk into its precomputed offset with bounded memory
    Streamed,
    /// Buffered below the configured limit, streamed above it
    #[default]
    Auto,
}

/// Lifecycle of an upload session.
///
/// `Pending -> Receiving -> Complete -> Merging -> Merged`. A failed or
/// cancelled merge returns the session to the state it was merged from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Session begun, no chunk received yet
    Pending,
    /// At least one chunk received
    Receiving,
    /// Client declared the final chunk count
    Complete { chunk_count: u64 },
    /// A merge of `chunk_count` chunks is running
    Merging { chunk_count: u64 },
    /// The artifact was produced; the staging area is gone
    Merged { size: u64 },
}

impl SessionState {
    /// Whether chunks may still be uploaded in this state
    #[must_use]
    pub const fn accepts_chunks(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Receiving | Self::Complete { .. }
        )
    }
}

/// Client-declared expectations recorded when a session begins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct SessionSpec {
    /// Number of chunks the client will send
    pub expected_chunks: Option<u64>,
    /// Total artifact size in bytes
    pub expected_size:   Option<u64>,
    /// SHA256 of the whole artifact (lowercase hex)
    pub sha256:          Option<String>,
}

/// Persistent record of one upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Artifact name the chunks belong to
    pub name:            String,
    /// Number of chunks the client declared when the session began
    pub expected_chunks: Option<u64>,
    /// Total artifact size declared when the session began
    pub expected_size:   Option<u64>,
    /// Artifact checksum declared when the session began
    pub sha256:          Option<String>,
    /// Current lifecycle state
    pub state:           SessionState,
    /// Unix timestamp when the session was created
    pub created_at:      i64,
    /// Unix timestamp of the last state transition
    pub updated_at:      i64,
}

impl UploadSession {
    /// The number of chunks a merge must find, if it is known yet
    #[must_use]
    pub const fn chunk_count(&self) -> Option<u64> {
        match self.state {
            SessionState::Complete { chunk_count } | SessionState::Merging { chunk_count } => {
                Some(chunk_count)
            }
            _ => self.expected_chunks,
        }
    }
}

/// Result of a successful merge
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Artifact name
    pub name:        String,
    /// Where the artifact now lives
    pub path:        PathBuf,
    /// Size of the artifact in bytes
    pub size:        u64,
    /// SHA256 of the artifact (lowercase hex), when computed during the merge
    pub sha256:      Option<String>,
    /// Number of chunks merged
    pub chunk_count: u64,
    /// Strategy actually used
    pub strategy:    MergeStrategy,
    /// Wall time of the merge
    pub duration:    Span,
}

/// Metadata of a completed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactStat {
    pub size:         u64,
    pub display_name: String,
}
