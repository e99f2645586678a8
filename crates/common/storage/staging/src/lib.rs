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

//! Chunk staging and reassembly.
//!
//! Clients upload a file as indexed chunks in any order. Each chunk is staged
//! under `(name, index)`; once the client declares the chunk count, a merge
//! reassembles the artifact in ascending index order, either in memory
//! ([`BufferedMerger`]) or with bounded memory ([`StreamedMerger`]), and
//! publishes it atomically. Completed artifacts are served by byte range.
//!
//! [`Stager`] is the entry point tying these together.

mod artifact;
mod buffered_merger;
mod config;
mod enumerator;
mod error;
mod lock;
mod path;
mod range_reader;
mod session;
mod stager;
mod store;
mod streamed_merger;
mod types;

pub use buffered_merger::{BufferedMerger, WrittenArtifact};
pub use config::StagingConfig;
pub use enumerator::{ChunkEnumerator, ensure_complete};
pub use error::{ErrorKind, Result, StagingError};
pub use path::{Layout, parse_chunk_index, validate_name};
pub use range_reader::{RangeReader, RangeStream};
pub use stager::Stager;
pub use store::ChunkStore;
pub use streamed_merger::{Placement, StreamedMerger, plan_offsets};
pub use types::{
    Artifact, ArtifactStat, ChunkEntry, MergeStrategy, SessionSpec, SessionState, UploadSession,
};
