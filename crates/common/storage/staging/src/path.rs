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

//! On-disk layout of a staging root:
//!
//! ```text
//! <root>/staging/<name>/<name>-<index>   staged chunks
//! <root>/incoming/<uuid>                  upload buffers
//! <root>/artifacts/<name>                 merged artifacts
//! <root>/artifacts/.partial-<name>-<uuid> merge output not yet visible
//! <root>/sessions/<name>.json             session records
//! <root>/.lock                            held by the owning process
//! ```

use std::path::{Path, PathBuf};

use snafu::ensure;
use uuid::Uuid;

use crate::error::{CorruptChunkSnafu, InvalidNameSnafu, Result};

const STAGING_DIR: &str = "staging";
const INCOMING_DIR: &str = "incoming";
const ARTIFACT_DIR: &str = "artifacts";
const SESSION_DIR: &str = "sessions";
pub(crate) const PARTIAL_PREFIX: &str = ".partial-";
const SESSION_EXTENSION: &str = "json";
const LOCK_FILE: &str = ".lock";

const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    pub fn staging_root(&self) -> PathBuf { self.root.join(STAGING_DIR) }

    pub fn staging_dir(&self, name: &str) -> PathBuf { self.staging_root().join(name) }

    pub fn chunk_path(&self, name: &str, index: u64) -> PathBuf {
        self.staging_dir(name).join(chunk_file_name(name, index))
    }

    pub fn incoming_dir(&self) -> PathBuf { self.root.join(INCOMING_DIR) }

    /// A fresh, unique upload buffer path.
    pub fn incoming_path(&self) -> PathBuf {
        self.incoming_dir().join(Uuid::new_v4().simple().to_string())
    }

    pub fn artifact_dir(&self) -> PathBuf { self.root.join(ARTIFACT_DIR) }

    pub fn artifact_path(&self, name: &str) -> PathBuf { self.artifact_dir().join(name) }

    /// A fresh, unique path for merge output that is not yet visible.
    pub fn partial_artifact_path(&self, name: &str) -> PathBuf {
        self.artifact_dir().join(format!(
            "{PARTIAL_PREFIX}{name}-{}",
            Uuid::new_v4().simple()
        ))
    }

    pub fn session_dir(&self) -> PathBuf { self.root.join(SESSION_DIR) }

    pub fn session_path(&self, name: &str) -> PathBuf {
        self.session_dir()
            .join(format!("{name}.{SESSION_EXTENSION}"))
    }

    pub fn lock_path(&self) -> PathBuf { self.root.join(LOCK_FILE) }

    /// Every directory the engine writes into.
    pub fn directories(&self) -> [PathBuf; 4] {
        [
            self.staging_root(),
            self.incoming_dir(),
            self.artifact_dir(),
            self.session_dir(),
        ]
    }
}

pub fn chunk_file_name(name: &str, index: u64) -> String { format!("{name}-{index}") }

/// Recover the index from a staged chunk's file name.
///
/// The suffix after the last `-` must be a canonical decimal: digits only,
/// no sign, no leading zeros. Anything else would make two entries able to
/// claim the same index.
pub fn parse_chunk_index(name: &str, entry: &str) -> Result<u64> {
    let suffix = entry
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'));
    let Some(suffix) = suffix else {
        return CorruptChunkSnafu {
            name,
            entry,
            reason: "entry does not belong to this name",
        }
        .fail();
    };

    ensure!(
        !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()),
        CorruptChunkSnafu {
            name,
            entry,
            reason: "index suffix is not a decimal integer",
        }
    );
    ensure!(
        suffix == "0" || !suffix.starts_with('0'),
        CorruptChunkSnafu {
            name,
            entry,
            reason: "index suffix has leading zeros",
        }
    );

    suffix.parse().ok().ok_or_else(|| {
        CorruptChunkSnafu {
            name,
            entry,
            reason: "index does not fit in 64 bits",
        }
        .build()
    })
}

/// Names become path components, so they must be a single, visible one.
pub fn validate_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty(),
        InvalidNameSnafu {
            name,
            reason: "name is empty",
        }
    );
    ensure!(
        name.len() <= MAX_NAME_LEN,
        InvalidNameSnafu {
            name,
            reason: "name is longer than 200 bytes",
        }
    );
    ensure!(
        !name.starts_with('.'),
        InvalidNameSnafu {
            name,
            reason: "name starts with a dot",
        }
    );
    ensure!(
        !name.contains(['/', '\\', '\0']),
        InvalidNameSnafu {
            name,
            reason: "name contains a path separator or NUL",
        }
    );
    Ok(())
}
