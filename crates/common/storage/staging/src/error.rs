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

use snafu::Snafu;
use splice_base::ReadableSize;
use strum_macros::Display;

use crate::types::SessionState;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StagingError {
    #[snafu(display("Invalid name {name:?}: {reason}"))]
    InvalidName { name: String, reason: &'static str },

    #[snafu(display("Invalid argument for {name}: {reason}"))]
    InvalidArgument { name: String, reason: String },

    #[snafu(display("No staged chunks for {name}"))]
    StagingNotFound { name: String },

    #[snafu(display("No upload session for {name}"))]
    SessionNotFound { name: String },

    #[snafu(display("No artifact named {name}"))]
    ArtifactNotFound { name: String },

    #[snafu(display(
        "Upload {name} is incomplete: expected {expected} chunks, staged {actual}, missing \
         {missing:?}"
    ))]
    IncompleteUpload {
        name:     String,
        expected: u64,
        actual:   usize,
        /// Missing indices, truncated to the first few.
        missing:  Vec<u64>,
    },

    #[snafu(display("Upload {name} has no declared chunk count"))]
    ChunkCountUnknown { name: String },

    #[snafu(display("Corrupt chunk entry {entry:?} for {name}: {reason}"))]
    CorruptChunk {
        name:   String,
        entry:  String,
        reason: &'static str,
    },

    #[snafu(display("Invalid range {start}-{end} for {name} of {size} bytes"))]
    InvalidRange {
        name:  String,
        start: u64,
        end:   u64,
        size:  u64,
    },

    #[snafu(display("Session {name} is {state}, cannot {action}"))]
    SessionState {
        name:   String,
        state:  SessionState,
        action: &'static str,
    },

    #[snafu(display("Merge for {name} is already running"))]
    MergeInProgress { name: String },

    #[snafu(display("Upload {name} is being aborted"))]
    AbortInProgress { name: String },

    #[snafu(display("Staging root is owned by another process (lock {})", path.display()))]
    RootLocked { path: PathBuf },

    #[snafu(display("{count} uploads for {name} are still in flight"))]
    UploadsInFlight { name: String, count: u32 },

    #[snafu(display(
        "Artifact {name} would be {size} bytes, above the buffered merge limit of {limit}"
    ))]
    BufferLimitExceeded {
        name:  String,
        size:  u64,
        limit: ReadableSize,
    },

    #[snafu(display("Artifact {name} size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch {
        name:     String,
        expected: u64,
        actual:   u64,
    },

    #[snafu(display("Artifact {name} SHA256 mismatch: expected {expected}, got {actual}"))]
    Sha256Mismatch {
        name:     String,
        expected: String,
        actual:   String,
    },

    #[snafu(display("Merge for {name} was cancelled"))]
    Cancelled { name: String },

    #[snafu(display("Storage I/O error at {}: {source}", path.display()))]
    Io {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Session record at {} is corrupted: {source}", path.display()))]
    SessionCorrupted {
        path:   PathBuf,
        source: serde_json::Error,
    },
}

/// Coarse classification a caller can act on: re-upload, retry the merge,
/// or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    IncompleteUpload,
    CorruptChunk,
    RangeError,
    Io,
    InvalidArgument,
    Conflict,
    Integrity,
    TooLarge,
    Cancelled,
}

impl StagingError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StagingNotFound { .. }
            | Self::SessionNotFound { .. }
            | Self::ArtifactNotFound { .. } => ErrorKind::NotFound,
            Self::IncompleteUpload { .. } | Self::ChunkCountUnknown { .. } => {
                ErrorKind::IncompleteUpload
            }
            Self::CorruptChunk { .. } | Self::SessionCorrupted { .. } => ErrorKind::CorruptChunk,
            Self::InvalidRange { .. } => ErrorKind::RangeError,
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidName { .. } | Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::SessionState { .. }
            | Self::MergeInProgress { .. }
            | Self::AbortInProgress { .. }
            | Self::RootLocked { .. }
            | Self::UploadsInFlight { .. } => ErrorKind::Conflict,
            Self::SizeMismatch { .. } | Self::Sha256Mismatch { .. } => ErrorKind::Integrity,
            Self::BufferLimitExceeded { .. } => ErrorKind::TooLarge,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T, E = StagingError> = std::result::Result<T, E>;
