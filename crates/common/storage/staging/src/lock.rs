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
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use fd_lock::RwLock;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    error::{IoSnafu, Result, RootLockedSnafu},
    path::Layout,
};

/// Exclusive ownership of a staging root.
///
/// Held for as long as the value lives; a second owner, in this process or
/// another, is refused with `RootLocked`.
pub struct RootLock {
    path:  PathBuf,
    _file: RwLock<File>,
}

impl RootLock {
    pub fn acquire(layout: &Layout) -> Result<Self> {
        let path = layout.lock_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu { path: &path })?;

        let mut lock = RwLock::new(file);
        match lock.try_write() {
            // The OS lock stays held until the descriptor closes with `lock`.
            Ok(guard) => std::mem::forget(guard),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return RootLockedSnafu { path }.fail();
            }
            Err(e) => return Err(e).context(IoSnafu { path }),
        }

        debug!(path = %path.display(), "Staging root locked");
        Ok(Self { path, _file: lock })
    }

    pub fn path(&self) -> &Path { &self.path }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StagingError;

    #[test]
    fn test_second_lock_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());

        let first = RootLock::acquire(&layout).unwrap();
        assert_eq!(first.path(), dir.path().join(".lock"));
        assert!(matches!(
            RootLock::acquire(&layout),
            Err(StagingError::RootLocked { .. })
        ));

        drop(first);
        RootLock::acquire(&layout).unwrap();
    }
}
