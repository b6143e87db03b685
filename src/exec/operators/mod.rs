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
//! Execution operators and their shared contracts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::ChunkBuilder;
use crate::exec::error::{ExecError, ExecResult};
use crate::runtime::mem_tracker::MemTracker;

pub mod mem_scan;
pub mod sort;
pub mod topn;

pub use mem_scan::MemScanExecutor;
pub use sort::SortExecutor;
pub use topn::TopNExecutor;

/// One ORDER BY key: output column index, direction, and NULL placement.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: usize,
    pub desc: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            desc: false,
            nulls_first: true,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            desc: true,
            nulls_first: true,
        }
    }
}

/// Per-query execution context: the tracker roots every operator attaches
/// under, plus the cancellation flag honored between child chunks.
pub struct ExecContext {
    mem_tracker: Arc<MemTracker>,
    disk_tracker: Arc<MemTracker>,
    cancelled: AtomicBool,
}

impl ExecContext {
    pub fn new() -> Self {
        Self {
            mem_tracker: MemTracker::new_root("query"),
            disk_tracker: MemTracker::new_root("query disk"),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn disk_tracker(&self) -> &Arc<MemTracker> {
        &self.disk_tracker
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> ExecResult<()> {
        if self.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        Ok(())
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Volcano-style batch executor.
///
/// `next` fills the provided builder; returning with an empty builder signals
/// end of stream. `close` must be idempotent.
pub trait Executor {
    fn schema(&self) -> SchemaRef;

    fn open(&mut self, ctx: &ExecContext) -> ExecResult<()>;

    fn next(&mut self, ctx: &ExecContext, out: &mut ChunkBuilder) -> ExecResult<()>;

    fn close(&mut self) -> ExecResult<()>;
}
