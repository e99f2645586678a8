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
use jiff::SignedDuration;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use splice_base::ReadableSize;

use crate::types::MergeStrategy;

/// Configuration for the staging engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct StagingConfig {
    /// Root directory holding staging areas, artifacts and session records
    /// (default: ./files)
    #[default(PathBuf::from("files"))]
    pub root_dir: PathBuf,

    /// Largest artifact a buffered merge may produce (default: 64MB)
    #[default(ReadableSize::mb(64))]
    pub buffered_merge_limit: ReadableSize,

    /// Maximum number of chunk writes in flight during a streamed merge
    /// (default: 8)
    #[default = 8]
    pub merge_concurrency: usize,

    /// Buffer size for chunk and artifact I/O (default: 512KB)
    #[default(ReadableSize::kb(512))]
    pub io_buffer_size: ReadableSize,

    /// Fsync chunks and artifacts before they become visible (default: true)
    #[default = true]
    pub sync_writes: bool,

    /// Strategy used when the caller does not pick one
    #[default(MergeStrategy::Auto)]
    pub default_strategy: MergeStrategy,

    /// How long the record of a merged session is kept (default: 24h)
    #[default(SignedDuration::from_hours(24))]
    pub merged_session_ttl: SignedDuration,
}

impl StagingConfig {
    /// Resolve `Auto` against the buffered merge limit.
    #[must_use]
    pub const fn resolve_strategy(&self, requested: MergeStrategy, total_size: u64) -> MergeStrategy {
        match requested {
            MergeStrategy::Auto if total_size <= self.buffered_merge_limit.as_bytes() => {
                MergeStrategy::Buffered
            }
            MergeStrategy::Auto => MergeStrategy::Streamed,
            explicit => explicit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StagingConfig::default();
        assert_eq!(config.root_dir, PathBuf::from("files"));
        assert_eq!(config.buffered_merge_limit, ReadableSize::mb(64));
        assert_eq!(config.merge_concurrency, 8);
        assert!(config.sync_writes);
        assert_eq!(config.default_strategy, MergeStrategy::Auto);
        assert_eq!(config.merged_session_ttl, SignedDuration::from_hours(24));
    }

    #[test]
    fn test_resolve_auto_strategy() {
        let config = StagingConfig {
            buffered_merge_limit: ReadableSize::kb(1),
            ..StagingConfig::default()
        };
        assert_eq!(
            config.resolve_strategy(MergeStrategy::Auto, 1024),
            MergeStrategy::Buffered
        );
        assert_eq!(
            config.resolve_strategy(MergeStrategy::Auto, 1025),
            MergeStrategy::Streamed
        );
        assert_eq!(
            config.resolve_strategy(MergeStrategy::Buffered, 1 << 30),
            MergeStrategy::Buffered
        );
    }
}
