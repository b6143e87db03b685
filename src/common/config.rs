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
//! Typed accessors over the optional config file. Every accessor falls back
//! to a built-in default so the library works without any config on disk.

use std::path::PathBuf;

use crate::common::app_config::config as micarocks_app_config;

pub(crate) fn max_batch_size() -> usize {
    micarocks_app_config()
        .ok()
        .map(|c| c.exec.max_batch_size)
        .unwrap_or(1024)
        .max(1)
}

pub(crate) fn oom_use_tmp_storage() -> bool {
    micarocks_app_config()
        .ok()
        .map(|c| c.exec.oom_use_tmp_storage)
        .unwrap_or(true)
}

pub(crate) fn topn_compaction_factor() -> usize {
    micarocks_app_config()
        .ok()
        .map(|c| c.exec.topn_compaction_factor)
        .unwrap_or(4)
        .max(1)
}

pub(crate) fn spill_local_dirs() -> Vec<PathBuf> {
    let configured = micarocks_app_config()
        .ok()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default();
    if configured.is_empty() {
        return vec![std::env::temp_dir().join("micarocks-spill")];
    }
    configured.into_iter().map(PathBuf::from).collect()
}

pub(crate) fn spill_ipc_compression() -> String {
    micarocks_app_config()
        .ok()
        .map(|c| c.spill.ipc_compression.clone())
        .unwrap_or_else(|| "lz4".to_string())
}

pub(crate) fn spill_io_threads() -> usize {
    micarocks_app_config()
        .ok()
        .map(|c| c.spill.io_threads)
        .unwrap_or(2)
}

pub(crate) fn spill_io_queue_size() -> usize {
    micarocks_app_config()
        .ok()
        .map(|c| c.spill.io_queue_size)
        .unwrap_or(64)
}
