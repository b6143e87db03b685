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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<MicaRocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static MicaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = MicaRocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static MicaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = MicaRocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static MicaRocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("MICAROCKS_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("micarocks.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $MICAROCKS_CONFIG or create ./micarocks.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct MicaRocksConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub spill: SpillStorageSection,
}

impl MicaRocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: MicaRocksConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

#[derive(Clone, Deserialize)]
pub struct ExecConfig {
    /// Upper bound on rows per chunk produced by executors.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// When false, sort executors never install a spill action and stay
    /// purely in-memory under memory pressure.
    #[serde(default = "default_oom_use_tmp_storage")]
    pub oom_use_tmp_storage: bool,

    #[serde(default = "default_topn_compaction_factor")]
    pub topn_compaction_factor: usize,
}

fn default_max_batch_size() -> usize {
    1024
}

fn default_oom_use_tmp_storage() -> bool {
    true
}

fn default_topn_compaction_factor() -> usize {
    4
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            oom_use_tmp_storage: default_oom_use_tmp_storage(),
            topn_compaction_factor: default_topn_compaction_factor(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SpillStorageSection {
    /// Directories used for spill files, round-robin. Empty means the
    /// process temp directory.
    #[serde(default)]
    pub local_dirs: Vec<String>,

    /// `none`, `lz4` or `zstd`.
    #[serde(default = "default_spill_ipc_compression")]
    pub ipc_compression: String,

    #[serde(default = "default_spill_io_threads")]
    pub io_threads: usize,

    #[serde(default = "default_spill_io_queue_size")]
    pub io_queue_size: usize,
}

fn default_spill_ipc_compression() -> String {
    "lz4".to_string()
}

fn default_spill_io_threads() -> usize {
    2
}

fn default_spill_io_queue_size() -> usize {
    64
}

impl Default for SpillStorageSection {
    fn default() -> Self {
        Self {
            local_dirs: Vec::new(),
            ipc_compression: default_spill_ipc_compression(),
            io_threads: default_spill_io_threads(),
            io_queue_size: default_spill_io_queue_size(),
        }
    }
}
