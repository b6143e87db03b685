// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::common::config;
use crate::exec::error::{ExecError, ExecResult};

/// Hands out spill file locations, round-robin over the configured
/// directories. File names carry no semantics beyond uniqueness.
#[derive(Debug)]
pub struct DirManager {
    dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
    next_file_id: AtomicU64,
    pid: u32,
}

impl DirManager {
    pub fn new(dirs: Vec<PathBuf>) -> ExecResult<Self> {
        if dirs.is_empty() {
            return Err(ExecError::DiskIo("spill.local_dirs is empty".to_string()));
        }
        for dir in &dirs {
            ensure_dir(dir)?;
        }
        Ok(Self {
            dirs,
            next_dir: AtomicUsize::new(0),
            next_file_id: AtomicU64::new(0),
            pid: std::process::id(),
        })
    }

    fn next_dir(&self) -> PathBuf {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        let pos = idx % self.dirs.len();
        self.dirs[pos].clone()
    }

    /// Create a fresh spill file, retrying on the unlikely name collision.
    pub fn create_spill_file(&self) -> ExecResult<(PathBuf, File)> {
        let mut attempts = 0;
        loop {
            let dir = self.next_dir();
            let id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
            let filename = format!("sort_spill_{:x}_{:x}.ipc", self.pid, id);
            let path = dir.join(filename);
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path);
            match file {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(ExecError::DiskIo(format!(
                        "create spill file {} failed: {err}",
                        path.display()
                    )));
                }
            }
        }
    }
}

fn ensure_dir(path: &Path) -> ExecResult<()> {
    if path.as_os_str().is_empty() {
        return Err(ExecError::DiskIo(
            "spill.local_dirs contains empty path".to_string(),
        ));
    }
    std::fs::create_dir_all(path).map_err(|e| {
        ExecError::DiskIo(format!("create spill directory {} failed: {e}", path.display()))
    })
}

static DIR_MANAGER: OnceLock<Result<Arc<DirManager>, ExecError>> = OnceLock::new();

/// Process-wide spill directory manager built from config.
pub fn spill_dir_manager() -> ExecResult<Arc<DirManager>> {
    DIR_MANAGER
        .get_or_init(|| DirManager::new(config::spill_local_dirs()).map(Arc::new))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_unique_files_round_robin() {
        let temp_a = tempdir().expect("tempdir");
        let temp_b = tempdir().expect("tempdir");
        let manager = DirManager::new(vec![
            temp_a.path().to_path_buf(),
            temp_b.path().to_path_buf(),
        ])
        .expect("dir manager");

        let (path_one, _file_one) = manager.create_spill_file().expect("file");
        let (path_two, _file_two) = manager.create_spill_file().expect("file");
        assert_ne!(path_one, path_two);
        assert_eq!(path_one.parent(), Some(temp_a.path()));
        assert_eq!(path_two.parent(), Some(temp_b.path()));
    }

    #[test]
    fn rejects_empty_dir_list() {
        assert!(DirManager::new(Vec::new()).is_err());
    }
}
