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
//! A place for many rows, so many that they may have to spill to disk.
//!
//! The container starts in-memory and can transition once to disk-backed
//! storage; the transition is the only operation that takes the phase write
//! lock, so producers and readers keep running under the read lock while a
//! background spill is pending. Readers observe the flip atomically: row refs
//! issued before the spill resolve to the same logical rows afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::exec::chunk::{Chunk, Row, RowRef};
use crate::exec::container::chunk_list::ChunkList;
use crate::exec::container::disk_list::DiskList;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::exec::spill::spill_channel::spill_io_executor;
use crate::micarocks_logging::info;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::oom_action::{FallbackSlot, OomAction, PRIORITY_SPILL};

struct ContainerInner {
    records: ChunkList,
    records_in_disk: Option<DiskList>,
    spill_error: Option<ExecError>,
}

pub struct RowContainer {
    schema: SchemaRef,
    max_chunk_size: usize,
    m: RwLock<ContainerInner>,
    // Phase probe for code that must not touch the phase lock (OOM actions
    // fire on the thread that is consuming memory under the read lock).
    spilled_flag: AtomicBool,
    mem_tracker: Arc<MemTracker>,
    disk_tracker: Arc<MemTracker>,
}

impl RowContainer {
    pub fn new(schema: SchemaRef, max_chunk_size: usize) -> Self {
        let mem_tracker = MemTracker::new_root("row container");
        let disk_tracker = MemTracker::new_root("row container disk");
        let records = ChunkList::new(
            Arc::clone(&schema),
            max_chunk_size,
            Arc::clone(&mem_tracker),
        );
        Self {
            schema,
            max_chunk_size: max_chunk_size.max(1),
            m: RwLock::new(ContainerInner {
                records,
                records_in_disk: None,
                spill_error: None,
            }),
            spilled_flag: AtomicBool::new(false),
            mem_tracker,
            disk_tracker,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn disk_tracker(&self) -> &Arc<MemTracker> {
        &self.disk_tracker
    }

    /// Whether the container has transitioned to disk. Safe to call from any
    /// thread, including OOM actions.
    pub fn spilled(&self) -> bool {
        self.spilled_flag.load(Ordering::Acquire)
    }

    /// Append a chunk, routed by phase. A spill failure recorded earlier is
    /// surfaced here.
    pub fn add_chunk(&self, chunk: Chunk) -> ExecResult<()> {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        if let Some(disk) = inner.records_in_disk.as_ref() {
            if let Some(err) = inner.spill_error.as_ref() {
                return Err(err.clone());
            }
            disk.add_chunk(&chunk)
        } else {
            inner.records.add_chunk(chunk)
        }
    }

    /// Copy a single row in. Only supported before the container spills.
    pub fn append_row(&self, row: &Row) -> ExecResult<RowRef> {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        if inner.records_in_disk.is_some() {
            if let Some(err) = inner.spill_error.as_ref() {
                return Err(err.clone());
            }
            return Err(ExecError::AppendRowAfterSpill);
        }
        inner.records.append_row(row)
    }

    pub fn get_row(&self, row_ref: RowRef) -> ExecResult<Row> {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        if let Some(disk) = inner.records_in_disk.as_ref() {
            if let Some(err) = inner.spill_error.as_ref() {
                return Err(err.clone());
            }
            disk.get_row(row_ref)
        } else {
            inner.records.get_row(row_ref)
        }
    }

    pub fn get_chunk(&self, chunk_idx: usize) -> ExecResult<Chunk> {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        if let Some(disk) = inner.records_in_disk.as_ref() {
            if let Some(err) = inner.spill_error.as_ref() {
                return Err(err.clone());
            }
            disk.get_chunk(chunk_idx)
        } else {
            inner.records.get_chunk(chunk_idx)
        }
    }

    pub fn num_rows(&self) -> usize {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        match inner.records_in_disk.as_ref() {
            Some(disk) => disk.num_rows(),
            None => inner.records.num_rows(),
        }
    }

    pub fn num_chunks(&self) -> usize {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        match inner.records_in_disk.as_ref() {
            Some(disk) => disk.num_chunks(),
            None => inner.records.num_chunks(),
        }
    }

    pub fn num_rows_of_chunk(&self, chunk_idx: usize) -> ExecResult<usize> {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        match inner.records_in_disk.as_ref() {
            Some(disk) => disk.num_rows_of_chunk(chunk_idx),
            None => inner.records.num_rows_of_chunk(chunk_idx),
        }
    }

    /// Rows still held in memory. Diagnostics only; spilled rows excluded.
    pub fn num_rows_in_memory(&self) -> usize {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        inner.records.num_rows()
    }

    pub(crate) fn seal_in_memory_tail(&self) -> ExecResult<()> {
        let inner = self.m.read().unwrap_or_else(|e| e.into_inner());
        if inner.records_in_disk.is_some() {
            return Ok(());
        }
        inner.records.seal_tail()
    }

    /// Move every in-memory chunk into a fresh spill file, then release the
    /// in-memory copy. Idempotent. On IO failure the error is recorded, the
    /// rows stay readable in memory, and later appends surface the error.
    pub fn spill_to_disk(&self) -> ExecResult<()> {
        let mut inner = self.m.write().unwrap_or_else(|e| e.into_inner());
        if inner.records_in_disk.is_some() || inner.records.num_rows() == 0 {
            return Ok(());
        }
        match self.build_disk_list(&inner.records) {
            Ok(disk) => {
                inner.records_in_disk = Some(disk);
                inner.records.clear();
                self.spilled_flag.store(true, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                inner.spill_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn build_disk_list(&self, records: &ChunkList) -> ExecResult<DiskList> {
        records.seal_tail()?;
        let codec = SpillCodec::from_str(&config::spill_ipc_compression())?;
        let disk = DiskList::new(
            Arc::clone(&self.schema),
            codec,
            Arc::clone(&self.disk_tracker),
        )?;
        for chunk_idx in 0..records.num_chunks() {
            let chunk = records.get_chunk(chunk_idx)?;
            disk.add_chunk(&chunk)?;
        }
        Ok(disk)
    }

    /// Return the container to empty without touching registered trackers.
    pub fn reset(&self) -> ExecResult<()> {
        let mut inner = self.m.write().unwrap_or_else(|e| e.into_inner());
        if let Some(disk) = inner.records_in_disk.take() {
            disk.close()?;
        }
        inner.spill_error = None;
        inner.records.clear();
        self.spilled_flag.store(false, Ordering::Release);
        Ok(())
    }

    /// Release all resources; the spill file, if any, is deleted.
    pub fn close(&self) -> ExecResult<()> {
        self.reset()
    }

    /// Build the memory-pressure callback for this container.
    pub fn action_spill(self: &Arc<Self>) -> Arc<SpillDiskAction> {
        Arc::new(SpillDiskAction {
            container: Mutex::new(Arc::downgrade(self)),
            fallback: FallbackSlot::default(),
            test_hooks: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn action_spill_with_hooks(
        self: &Arc<Self>,
        before: Arc<dyn Fn() + Send + Sync>,
        after: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<SpillDiskAction> {
        Arc::new(SpillDiskAction {
            container: Mutex::new(Arc::downgrade(self)),
            fallback: FallbackSlot::default(),
            test_hooks: Some(SpillTestHooks { before, after }),
        })
    }
}

pub(crate) struct SpillTestHooks {
    pub(crate) before: Arc<dyn Fn() + Send + Sync>,
    pub(crate) after: Arc<dyn Fn() + Send + Sync>,
}

/// Memory-pressure callback that spills a row container in the background.
///
/// If the container has already spilled, or holds nothing worth spilling,
/// pressure is forwarded to the fallback action.
pub struct SpillDiskAction {
    container: Mutex<Weak<RowContainer>>,
    fallback: FallbackSlot,
    test_hooks: Option<SpillTestHooks>,
}

impl SpillDiskAction {
    /// Re-point the action at a freshly created successor container.
    pub fn reset_container(&self, container: &Arc<RowContainer>) {
        let mut guard = self.container.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::downgrade(container);
    }
}

impl OomAction for SpillDiskAction {
    fn action(&self, tracker: &MemTracker) {
        let guard = self.container.lock().unwrap_or_else(|e| e.into_inner());
        let Some(container) = guard.upgrade() else {
            drop(guard);
            self.fallback.delegate(tracker);
            return;
        };
        if container.spilled() || container.mem_tracker().current() == 0 {
            drop(guard);
            self.fallback.delegate(tracker);
            return;
        }
        info!(
            "memory exceeds quota, spill to disk now: consumed={} quota={}",
            tracker.current(),
            tracker.limit()
        );
        if let Some(hooks) = self.test_hooks.as_ref() {
            (hooks.before)();
            let after = Arc::clone(&hooks.after);
            spill_io_executor().force_submit(Box::new(move || {
                let result = container.spill_to_disk();
                after();
                result
            }));
            return;
        }
        spill_io_executor().force_submit(Box::new(move || container.spill_to_disk()));
    }

    fn set_fallback(&self, fallback: Arc<dyn OomAction>) {
        self.fallback.set(fallback);
    }

    fn fallback(&self) -> Option<Arc<dyn OomAction>> {
        self.fallback.get()
    }

    fn priority(&self) -> i64 {
        PRIORITY_SPILL
    }
}
