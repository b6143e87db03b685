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
//! A row container with a sortable row-pointer index.
//!
//! Lifecycle is one-way: open (accepting appends) -> frozen (pointers built
//! and sorted) -> spilled. The pointer lock is the authoritative freeze
//! check: appends hold it shared while frozen-ness is probed, so a
//! spill-triggered freeze can never slip underneath an in-flight append, and
//! an append can never land after the pointers are built.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::{Chunk, CompareFunc, Row, RowRef};
use crate::exec::container::row_container::{RowContainer, SpillTestHooks};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::spill::spill_channel::spill_io_executor;
use crate::micarocks_logging::info;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::oom_action::{FallbackSlot, OomAction, PRIORITY_SPILL};

pub struct SortedRowContainer {
    container: RowContainer,
    by_desc: Vec<bool>,
    key_columns: Vec<usize>,
    key_cmp_funcs: Vec<CompareFunc>,
    row_ptrs: RwLock<Option<Vec<RowRef>>>,
    ptr_charged: AtomicI64,
}

impl SortedRowContainer {
    pub fn new(
        schema: SchemaRef,
        max_chunk_size: usize,
        by_desc: Vec<bool>,
        key_columns: Vec<usize>,
        key_cmp_funcs: Vec<CompareFunc>,
    ) -> Self {
        Self {
            container: RowContainer::new(schema, max_chunk_size),
            by_desc,
            key_columns,
            key_cmp_funcs,
            row_ptrs: RwLock::new(None),
            ptr_charged: AtomicI64::new(0),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.container.schema()
    }

    pub fn max_chunk_size(&self) -> usize {
        self.container.max_chunk_size()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        self.container.mem_tracker()
    }

    pub fn disk_tracker(&self) -> &Arc<MemTracker> {
        self.container.disk_tracker()
    }

    pub fn spilled(&self) -> bool {
        self.container.spilled()
    }

    pub fn num_rows(&self) -> usize {
        self.container.num_rows()
    }

    pub fn num_chunks(&self) -> usize {
        self.container.num_chunks()
    }

    pub fn get_row(&self, row_ref: RowRef) -> ExecResult<Row> {
        self.container.get_row(row_ref)
    }

    pub fn get_chunk(&self, chunk_idx: usize) -> ExecResult<Chunk> {
        self.container.get_chunk(chunk_idx)
    }

    /// Whether the container has been frozen by `init_pointers_and_sort`.
    pub fn sorted(&self) -> bool {
        let guard = self.row_ptrs.read().unwrap_or_else(|e| e.into_inner());
        guard.is_some()
    }

    /// Append a chunk. Rejected once the container is frozen.
    pub fn add_chunk(&self, chunk: Chunk) -> ExecResult<()> {
        let guard = self.row_ptrs.read().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(ExecError::AlreadySorted);
        }
        self.container.add_chunk(chunk)
    }

    /// Copy a single row in. Rejected once the container is frozen.
    pub fn append_row(&self, row: &Row) -> ExecResult<RowRef> {
        let guard = self.row_ptrs.read().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(ExecError::AlreadySorted);
        }
        self.container.append_row(row)
    }

    /// Composite-key comparison: the first non-equal key column decides,
    /// with the per-key direction applied.
    pub fn compare_rows(&self, left: &Row, right: &Row) -> CmpOrdering {
        for (i, &col) in self.key_columns.iter().enumerate() {
            let mut ord = (self.key_cmp_funcs[i])(left, col, right, col);
            if self.by_desc[i] {
                ord = ord.reverse();
            }
            if ord != CmpOrdering::Equal {
                return ord;
            }
        }
        CmpOrdering::Equal
    }

    pub fn less_row(&self, left: &Row, right: &Row) -> bool {
        self.compare_rows(left, right) == CmpOrdering::Less
    }

    /// Build the row-pointer index over every row in insertion order, then
    /// sort it under the composite key. Idempotent; freezes the container.
    pub fn init_pointers_and_sort(&self) -> ExecResult<()> {
        let mut guard = self.row_ptrs.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        self.container.seal_in_memory_tail()?;

        let mut entries: Vec<(RowRef, Row)> = Vec::with_capacity(self.container.num_rows());
        for chunk_idx in 0..self.container.num_chunks() {
            let chunk = self.container.get_chunk(chunk_idx)?;
            for row_idx in 0..chunk.num_rows() {
                entries.push((RowRef::new(chunk_idx, row_idx), chunk.get_row(row_idx)?));
            }
        }
        entries.sort_by(|(_, a), (_, b)| self.compare_rows(a, b));
        let row_ptrs: Vec<RowRef> = entries.into_iter().map(|(row_ref, _)| row_ref).collect();

        let ptr_bytes = (std::mem::size_of::<RowRef>() * row_ptrs.capacity()) as i64;
        self.container.mem_tracker().consume(ptr_bytes);
        self.ptr_charged.store(ptr_bytes, Ordering::Release);

        *guard = Some(row_ptrs);
        Ok(())
    }

    /// Sort, then move the rows to disk. The sorted pointer index survives
    /// the spill, so rank-ordered reads translate through the disk list.
    pub fn sort_and_spill(&self) -> ExecResult<()> {
        self.init_pointers_and_sort()?;
        self.container.spill_to_disk()
    }

    /// The row at rank `rank` under the sorted order. Requires frozen.
    pub fn get_row_by_rank(&self, rank: usize) -> ExecResult<Row> {
        let guard = self.row_ptrs.read().unwrap_or_else(|e| e.into_inner());
        let row_ptrs = guard.as_ref().ok_or_else(|| {
            ExecError::Internal("row container is not sorted yet".to_string())
        })?;
        let row_ref = *row_ptrs.get(rank).ok_or_else(|| {
            ExecError::Internal(format!(
                "rank {rank} out of bounds for {} sorted rows",
                row_ptrs.len()
            ))
        })?;
        drop(guard);
        self.container.get_row(row_ref)
    }

    fn release_ptr_charge(&self) {
        let charged = self.ptr_charged.swap(0, Ordering::AcqRel);
        self.container.mem_tracker().release(charged);
    }

    pub fn reset(&self) -> ExecResult<()> {
        let mut guard = self.row_ptrs.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.release_ptr_charge();
        self.container.reset()
    }

    pub fn close(&self) -> ExecResult<()> {
        let mut guard = self.row_ptrs.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.release_ptr_charge();
        self.container.close()
    }

    /// Build the memory-pressure callback for this container.
    pub fn action_spill(self: &Arc<Self>) -> Arc<SortAndSpillAction> {
        Arc::new(SortAndSpillAction {
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
    ) -> Arc<SortAndSpillAction> {
        Arc::new(SortAndSpillAction {
            container: Mutex::new(Arc::downgrade(self)),
            fallback: FallbackSlot::default(),
            test_hooks: Some(SpillTestHooks { before, after }),
        })
    }
}

/// Memory-pressure callback that sorts and spills a sorted row container.
///
/// The sort must run before the disk writes so the partition's pointer index
/// describes the spilled rows.
pub struct SortAndSpillAction {
    container: Mutex<Weak<SortedRowContainer>>,
    fallback: FallbackSlot,
    test_hooks: Option<SpillTestHooks>,
}

impl SortAndSpillAction {
    /// Re-point the action at a freshly created successor container.
    pub fn reset_container(&self, container: &Arc<SortedRowContainer>) {
        let mut guard = self.container.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::downgrade(container);
    }
}

impl OomAction for SortAndSpillAction {
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
            "memory exceeds quota, sort and spill to disk now: consumed={} quota={}",
            tracker.current(),
            tracker.limit()
        );
        if let Some(hooks) = self.test_hooks.as_ref() {
            (hooks.before)();
            let after = Arc::clone(&hooks.after);
            spill_io_executor().force_submit(Box::new(move || {
                let result = container.sort_and_spill();
                after();
                result
            }));
            return;
        }
        spill_io_executor().force_submit(Box::new(move || container.sort_and_spill()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::get_compare_func;
    use arrow::array::{Array, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::mpsc;
    use std::time::Duration;

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]))
    }

    fn int_chunk(values: &[i64]) -> Chunk {
        let batch = RecordBatch::try_new(
            int_schema(),
            vec![Arc::new(Int64Array::from(values.to_vec()))],
        )
        .expect("record batch");
        Chunk::new(batch)
    }

    fn int_value(row: &Row) -> i64 {
        row.column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column")
            .value(row.index())
    }

    fn sorted_container(desc: bool) -> SortedRowContainer {
        let cmp = get_compare_func(&DataType::Int64, false).expect("cmp");
        SortedRowContainer::new(int_schema(), 4, vec![desc], vec![0], vec![cmp])
    }

    fn drain_by_rank(container: &SortedRowContainer) -> Vec<i64> {
        (0..container.num_rows())
            .map(|rank| int_value(&container.get_row_by_rank(rank).expect("row")))
            .collect()
    }

    #[test]
    fn sorts_ascending_by_rank() {
        let container = sorted_container(false);
        container.add_chunk(int_chunk(&[3, 1, 4])).expect("add");
        container.add_chunk(int_chunk(&[1, 5, 9, 2, 6])).expect("add");
        container.init_pointers_and_sort().expect("sort");
        assert_eq!(drain_by_rank(&container), vec![1, 1, 2, 3, 4, 5, 6, 9]);
        container.close().expect("close");
    }

    #[test]
    fn desc_direction_flips_the_order() {
        let container = sorted_container(true);
        container.add_chunk(int_chunk(&[3, 1, 4, 1, 5])).expect("add");
        container.init_pointers_and_sort().expect("sort");
        assert_eq!(drain_by_rank(&container), vec![5, 4, 3, 1, 1]);
        container.close().expect("close");
    }

    #[test]
    fn append_after_freeze_is_rejected_and_count_unchanged() {
        let container = sorted_container(false);
        container.add_chunk(int_chunk(&[2, 1])).expect("add");
        container.init_pointers_and_sort().expect("sort");
        // idempotent
        container.init_pointers_and_sort().expect("sort again");
        let err = container.add_chunk(int_chunk(&[7])).unwrap_err();
        assert_eq!(err, ExecError::AlreadySorted);
        let source = int_chunk(&[8]);
        let err = container
            .append_row(&source.get_row(0).expect("row"))
            .unwrap_err();
        assert_eq!(err, ExecError::AlreadySorted);
        assert_eq!(container.num_rows(), 2);
        container.close().expect("close");
    }

    #[test]
    fn sort_and_spill_reads_back_in_order_from_disk() {
        let container = sorted_container(false);
        container.add_chunk(int_chunk(&[9, 2, 6])).expect("add");
        container.add_chunk(int_chunk(&[5, 3])).expect("add");
        container.sort_and_spill().expect("sort and spill");
        assert!(container.spilled());
        assert!(container.sorted());
        assert_eq!(drain_by_rank(&container), vec![2, 3, 5, 6, 9]);
        container.close().expect("close");
        assert_eq!(container.disk_tracker().current(), 0);
    }

    #[test]
    fn close_releases_pointer_charge() {
        let container = sorted_container(false);
        container.add_chunk(int_chunk(&[1, 2, 3])).expect("add");
        container.init_pointers_and_sort().expect("sort");
        assert!(container.mem_tracker().current() > 0);
        container.close().expect("close");
        assert_eq!(container.mem_tracker().current(), 0);
    }

    #[test]
    fn background_sort_and_spill_freezes_then_appends_fail() {
        let container = Arc::new(sorted_container(false));
        container.add_chunk(int_chunk(&[4, 4, 2])).expect("add");

        let (after_tx, after_rx) = mpsc::channel::<()>();
        let action = container.action_spill_with_hooks(
            Arc::new(|| {}),
            Arc::new(move || {
                let _ = after_tx.send(());
            }),
        );
        let tracker = MemTracker::new_root("query");
        action.action(&tracker);
        after_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("background sort-and-spill finished");

        assert!(container.spilled());
        let err = container.add_chunk(int_chunk(&[1])).unwrap_err();
        assert_eq!(err, ExecError::AlreadySorted);
        assert_eq!(drain_by_rank(&container), vec![2, 4, 4]);
        container.close().expect("close");
    }
}
