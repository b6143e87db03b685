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
//! External sort executor.
//!
//! Fetch phase: child chunks are buffered in a sorted row container; when the
//! memory-pressure action freezes and spills the container out from under the
//! fetch loop, the loop rolls over to a fresh container and the frozen one
//! becomes a finished partition. Output phase: one partition streams
//! sequentially, several partitions merge through a k-way min-heap over
//! per-partition rank cursors.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::exec::chunk::{ChunkBuilder, CompareFunc, Row, get_compare_func};
use crate::exec::container::sorted_row_container::{SortAndSpillAction, SortedRowContainer};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::operators::{ExecContext, Executor, SortKey};
use crate::runtime::mem_tracker::MemTracker;

type RowCompare = Arc<dyn Fn(&Row, &Row) -> CmpOrdering + Send + Sync>;

pub struct SortExecutor {
    child: Box<dyn Executor>,
    keys: Vec<SortKey>,
    max_batch_size: usize,

    by_desc: Vec<bool>,
    key_columns: Vec<usize>,
    key_cmp_funcs: Vec<CompareFunc>,

    // container currently receiving child chunks
    row_chunks: Option<Arc<SortedRowContainer>>,
    // finished sorted runs, one per spill plus the in-memory tail
    partition_list: Vec<Arc<SortedRowContainer>>,
    multi_way_merge: Option<MultiWayMerge>,
    spill_action: Option<Arc<SortAndSpillAction>>,

    mem_tracker: Option<Arc<MemTracker>>,
    disk_tracker: Option<Arc<MemTracker>>,

    idx: usize,
    fetched: bool,
    closed: bool,
}

impl SortExecutor {
    pub fn new(child: Box<dyn Executor>, keys: Vec<SortKey>) -> Self {
        Self {
            child,
            keys,
            max_batch_size: config::max_batch_size(),
            by_desc: Vec::new(),
            key_columns: Vec::new(),
            key_cmp_funcs: Vec::new(),
            row_chunks: None,
            partition_list: Vec::new(),
            multi_way_merge: None,
            spill_action: None,
            mem_tracker: None,
            disk_tracker: None,
            idx: 0,
            fetched: false,
            closed: false,
        }
    }

    /// Override the per-chunk row cap (defaults to the config value).
    pub fn with_max_batch_size(mut self, rows: usize) -> Self {
        self.max_batch_size = rows.max(1);
        self
    }

    /// Number of finished sorted runs. Meaningful after the fetch phase.
    pub fn num_partitions(&self) -> usize {
        self.partition_list.len()
    }

    pub fn num_spilled_partitions(&self) -> usize {
        self.partition_list.iter().filter(|p| p.spilled()).count()
    }

    fn init_compare_funcs(&mut self) -> ExecResult<()> {
        if !self.key_cmp_funcs.is_empty() {
            return Ok(());
        }
        let schema = self.child.schema();
        for key in &self.keys {
            let field = schema.fields().get(key.column).ok_or_else(|| {
                ExecError::Internal(format!(
                    "sort key column {} out of bounds for schema with {} fields",
                    key.column,
                    schema.fields().len()
                ))
            })?;
            self.by_desc.push(key.desc);
            self.key_columns.push(key.column);
            self.key_cmp_funcs
                .push(get_compare_func(field.data_type(), key.nulls_first)?);
        }
        Ok(())
    }

    fn build_row_compare(&self) -> RowCompare {
        let by_desc = self.by_desc.clone();
        let key_columns = self.key_columns.clone();
        let funcs = self.key_cmp_funcs.clone();
        Arc::new(move |left: &Row, right: &Row| {
            for (i, &col) in key_columns.iter().enumerate() {
                let mut ord = (funcs[i])(left, col, right, col);
                if by_desc[i] {
                    ord = ord.reverse();
                }
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            CmpOrdering::Equal
        })
    }

    fn new_partition_container(&self) -> Arc<SortedRowContainer> {
        let container = Arc::new(SortedRowContainer::new(
            self.child.schema(),
            self.max_batch_size,
            self.by_desc.clone(),
            self.key_columns.clone(),
            self.key_cmp_funcs.clone(),
        ));
        if let Some(tracker) = self.mem_tracker.as_ref() {
            container.mem_tracker().attach_to(tracker);
            container.mem_tracker().set_label("row chunks");
        }
        if let Some(tracker) = self.disk_tracker.as_ref() {
            container.disk_tracker().attach_to(tracker);
            container.disk_tracker().set_label("row chunks");
        }
        container
    }

    fn fetch_row_chunks(&mut self, ctx: &ExecContext) -> ExecResult<()> {
        let schema = self.child.schema();
        let max_batch_size = self.max_batch_size;

        let mut container = self.new_partition_container();
        if config::oom_use_tmp_storage() {
            let action = container.action_spill();
            ctx.mem_tracker()
                .fallback_old_and_set_new_action(action.clone());
            self.spill_action = Some(action);
        }
        self.row_chunks = Some(Arc::clone(&container));

        loop {
            ctx.check_cancelled()?;
            let mut builder = ChunkBuilder::new(Arc::clone(&schema), max_batch_size)?;
            self.child.next(ctx, &mut builder)?;
            if builder.is_empty() {
                break;
            }
            let chunk = builder.finish()?;
            match container.add_chunk(chunk.clone()) {
                Err(ExecError::AlreadySorted) => {
                    // The spill action froze this container under us: it is a
                    // finished partition now. Roll over and retry.
                    self.partition_list.push(Arc::clone(&container));
                    container = self.new_partition_container();
                    if let Some(action) = self.spill_action.as_ref() {
                        action.reset_container(&container);
                    }
                    self.row_chunks = Some(Arc::clone(&container));
                    container.add_chunk(chunk)?;
                }
                other => other?,
            }
        }

        if container.num_rows() > 0 {
            container.init_pointers_and_sort()?;
            self.partition_list.push(container);
        }
        self.row_chunks = None;
        Ok(())
    }

    fn stream_single_partition(&mut self, out: &mut ChunkBuilder) -> ExecResult<()> {
        let partition = &self.partition_list[0];
        while !out.is_full() && self.idx < partition.num_rows() {
            let row = partition.get_row_by_rank(self.idx)?;
            out.append_row(&row)?;
            self.idx += 1;
        }
        Ok(())
    }

    fn external_sorting(&mut self, out: &mut ChunkBuilder) -> ExecResult<()> {
        if self.multi_way_merge.is_none() {
            let mut merge = MultiWayMerge::new(self.build_row_compare());
            for (partition_id, partition) in self.partition_list.iter().enumerate() {
                if partition.num_rows() == 0 {
                    continue;
                }
                let row = partition.get_row_by_rank(0)?;
                merge.push_initial(MergeCursor {
                    row,
                    partition_id,
                    consumed: 0,
                });
            }
            merge.init();
            self.multi_way_merge = Some(merge);
        }

        let mut merge = self.multi_way_merge.take().expect("merge initialized");
        let result = (|| -> ExecResult<()> {
            while !out.is_full() && !merge.is_empty() {
                let (row, partition_id, consumed) = {
                    let root = merge.root();
                    (root.row.clone(), root.partition_id, root.consumed + 1)
                };
                out.append_row(&row)?;
                let partition = &self.partition_list[partition_id];
                if consumed >= partition.num_rows() {
                    merge.remove_root();
                    continue;
                }
                let next_row = partition.get_row_by_rank(consumed)?;
                merge.replace_root(MergeCursor {
                    row: next_row,
                    partition_id,
                    consumed,
                });
            }
            Ok(())
        })();
        self.multi_way_merge = Some(merge);
        result
    }
}

impl Executor for SortExecutor {
    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn open(&mut self, ctx: &ExecContext) -> ExecResult<()> {
        self.child.open(ctx)?;
        if self.mem_tracker.is_none() {
            self.mem_tracker = Some(MemTracker::new_child("sort executor", ctx.mem_tracker()));
            self.disk_tracker = Some(MemTracker::new_child(
                "sort executor",
                ctx.disk_tracker(),
            ));
        }
        self.partition_list.clear();
        self.multi_way_merge = None;
        self.idx = 0;
        self.fetched = false;
        self.closed = false;
        Ok(())
    }

    fn next(&mut self, ctx: &ExecContext, out: &mut ChunkBuilder) -> ExecResult<()> {
        out.reset();
        if !self.fetched {
            self.init_compare_funcs()?;
            self.fetch_row_chunks(ctx)?;
            self.fetched = true;
        }
        if self.partition_list.is_empty() {
            return Ok(());
        }
        if self.partition_list.len() > 1 {
            self.external_sorting(out)
        } else {
            self.stream_single_partition(out)
        }
    }

    fn close(&mut self) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err: Option<ExecError> = None;
        if let Some(container) = self.row_chunks.take() {
            if let Err(err) = container.close() {
                first_err.get_or_insert(err);
            }
        }
        for partition in self.partition_list.drain(..) {
            if let Err(err) = partition.close() {
                first_err.get_or_insert(err);
            }
        }
        self.multi_way_merge = None;
        self.spill_action = None;
        if let Err(err) = self.child.close() {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct MergeCursor {
    row: Row,
    partition_id: usize,
    consumed: usize,
}

/// Min-heap over per-partition cursors, keyed by the composite comparator.
struct MultiWayMerge {
    cmp: RowCompare,
    elements: Vec<MergeCursor>,
}

impl MultiWayMerge {
    fn new(cmp: RowCompare) -> Self {
        Self {
            cmp,
            elements: Vec::new(),
        }
    }

    fn push_initial(&mut self, cursor: MergeCursor) {
        self.elements.push(cursor);
    }

    fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn root(&self) -> &MergeCursor {
        &self.elements[0]
    }

    fn less(&self, i: usize, j: usize) -> bool {
        (self.cmp)(&self.elements[i].row, &self.elements[j].row) == CmpOrdering::Less
    }

    fn init(&mut self) {
        let len = self.elements.len();
        for i in (0..len / 2).rev() {
            self.sift_down(i);
        }
    }

    fn sift_down(&mut self, mut root: usize) {
        let len = self.elements.len();
        loop {
            let left = 2 * root + 1;
            if left >= len {
                break;
            }
            let mut smallest = root;
            if self.less(left, smallest) {
                smallest = left;
            }
            let right = left + 1;
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == root {
                break;
            }
            self.elements.swap(root, smallest);
            root = smallest;
        }
    }

    fn replace_root(&mut self, cursor: MergeCursor) {
        self.elements[0] = cursor;
        self.sift_down(0);
    }

    fn remove_root(&mut self) {
        let last = self.elements.len() - 1;
        self.elements.swap(0, last);
        self.elements.pop();
        if !self.elements.is_empty() {
            self.sift_down(0);
        }
    }
}
