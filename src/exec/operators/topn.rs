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
//! Top-N executor.
//!
//! Keeps the `offset + count` rows that sort first under the requested order
//! in a max-heap of row pointers over a single row container. Incoming rows
//! that beat the heap root are copied into the container; the stale root
//! pointer is replaced in place and sifted down. Because adversarial input
//! (e.g. ascending data under a descending order) replaces the root on every
//! row, the container is compacted once it grows past
//! `topn_compaction_factor * N` rows, bounding memory.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::exec::chunk::{Chunk, ChunkBuilder, CompareFunc, Row, RowRef, get_compare_func};
use crate::exec::container::row_container::RowContainer;
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::operators::{ExecContext, Executor, SortKey};
use crate::runtime::mem_tracker::MemTracker;

pub struct TopNExecutor {
    child: Box<dyn Executor>,
    keys: Vec<SortKey>,
    offset: usize,
    count: usize,
    max_batch_size: usize,
    compaction_factor: usize,

    by_desc: Vec<bool>,
    key_columns: Vec<usize>,
    key_cmp_funcs: Vec<CompareFunc>,

    total_limit: usize,
    row_container: Option<Arc<RowContainer>>,
    row_ptrs: Vec<RowRef>,
    ptr_charged: i64,

    mem_tracker: Option<Arc<MemTracker>>,

    idx: usize,
    fetched: bool,
    closed: bool,
    peak_buffered_rows: usize,
}

impl TopNExecutor {
    pub fn new(child: Box<dyn Executor>, keys: Vec<SortKey>, offset: usize, count: usize) -> Self {
        Self {
            child,
            keys,
            offset,
            count,
            max_batch_size: config::max_batch_size(),
            compaction_factor: config::topn_compaction_factor(),
            by_desc: Vec::new(),
            key_columns: Vec::new(),
            key_cmp_funcs: Vec::new(),
            total_limit: 0,
            row_container: None,
            row_ptrs: Vec::new(),
            ptr_charged: 0,
            mem_tracker: None,
            idx: 0,
            fetched: false,
            closed: false,
            peak_buffered_rows: 0,
        }
    }

    /// Override the per-chunk row cap (defaults to the config value).
    pub fn with_max_batch_size(mut self, rows: usize) -> Self {
        self.max_batch_size = rows.max(1);
        self
    }

    /// Override the compaction trigger (defaults to the config value).
    pub fn with_compaction_factor(mut self, factor: usize) -> Self {
        self.compaction_factor = factor.max(1);
        self
    }

    /// High-water mark of rows buffered in the container during execution.
    pub fn peak_buffered_rows(&self) -> usize {
        self.peak_buffered_rows
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

    fn compare_rows(&self, left: &Row, right: &Row) -> CmpOrdering {
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

    /// Heap relation: `left` is "greater" when it sorts later under the
    /// requested order, i.e. it is a worse top-n candidate.
    fn greater_row(&self, left: &Row, right: &Row) -> bool {
        self.compare_rows(left, right) == CmpOrdering::Greater
    }

    fn container(&self) -> ExecResult<&Arc<RowContainer>> {
        self.row_container
            .as_ref()
            .ok_or_else(|| ExecError::Internal("top-n row container is missing".to_string()))
    }

    fn new_container(&self) -> Arc<RowContainer> {
        let container = Arc::new(RowContainer::new(self.child.schema(), self.max_batch_size));
        if let Some(tracker) = self.mem_tracker.as_ref() {
            container.mem_tracker().attach_to(tracker);
            container.mem_tracker().set_label("top-n rows");
        }
        container
    }

    fn charge_ptrs(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.ptr_charged);
            let bytes = (std::mem::size_of::<RowRef>() * self.row_ptrs.capacity()) as i64;
            tracker.consume(bytes);
            self.ptr_charged = bytes;
        }
    }

    fn release_ptr_charge(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.ptr_charged);
        }
        self.ptr_charged = 0;
    }

    fn note_buffered_rows(&mut self, rows: usize) {
        if rows > self.peak_buffered_rows {
            self.peak_buffered_rows = rows;
        }
    }

    /// Pull child chunks until the container holds `total_limit` rows (or the
    /// child is exhausted), then build the pointer index in insertion order.
    fn load_chunks_until_total_limit(&mut self, ctx: &ExecContext) -> ExecResult<()> {
        let schema = self.child.schema();
        let max_batch_size = self.max_batch_size;
        let container = self.new_container();

        while container.num_rows() < self.total_limit {
            ctx.check_cancelled()?;
            let mut builder = ChunkBuilder::new(Arc::clone(&schema), max_batch_size)?;
            builder.set_required_rows(self.total_limit - container.num_rows());
            self.child.next(ctx, &mut builder)?;
            if builder.is_empty() {
                break;
            }
            container.add_chunk(builder.finish()?)?;
        }

        let mut row_ptrs = Vec::with_capacity(container.num_rows());
        for chunk_idx in 0..container.num_chunks() {
            for row_idx in 0..container.num_rows_of_chunk(chunk_idx)? {
                row_ptrs.push(RowRef::new(chunk_idx, row_idx));
            }
        }
        self.note_buffered_rows(container.num_rows());
        self.row_ptrs = row_ptrs;
        self.charge_ptrs();
        self.row_container = Some(container);
        Ok(())
    }

    fn row_at(&self, row_ref: RowRef) -> ExecResult<Row> {
        self.container()?.get_row(row_ref)
    }

    fn heap_sift_down(&mut self, mut root: usize) -> ExecResult<()> {
        let len = self.row_ptrs.len();
        loop {
            let left = 2 * root + 1;
            if left >= len {
                break;
            }
            let mut largest = root;
            let mut largest_row = self.row_at(self.row_ptrs[largest])?;
            let left_row = self.row_at(self.row_ptrs[left])?;
            if self.greater_row(&left_row, &largest_row) {
                largest = left;
                largest_row = left_row;
            }
            let right = left + 1;
            if right < len {
                let right_row = self.row_at(self.row_ptrs[right])?;
                if self.greater_row(&right_row, &largest_row) {
                    largest = right;
                }
            }
            if largest == root {
                break;
            }
            self.row_ptrs.swap(root, largest);
            root = largest;
        }
        Ok(())
    }

    fn heap_init(&mut self) -> ExecResult<()> {
        let len = self.row_ptrs.len();
        for i in (0..len / 2).rev() {
            self.heap_sift_down(i)?;
        }
        Ok(())
    }

    fn heap_pop_root(&mut self) -> ExecResult<()> {
        let last = self.row_ptrs.len() - 1;
        self.row_ptrs.swap(0, last);
        self.row_ptrs.pop();
        if !self.row_ptrs.is_empty() {
            self.heap_sift_down(0)?;
        }
        Ok(())
    }

    /// Max-heap replacement scan over one child chunk: every row that sorts
    /// strictly before the heap root evicts it.
    fn process_child_chunk(&mut self, chunk: Chunk) -> ExecResult<()> {
        for i in 0..chunk.num_rows() {
            let heap_max = self.row_at(self.row_ptrs[0])?;
            let next = chunk.get_row(i)?;
            if self.greater_row(&heap_max, &next) {
                // The new pointer must be installed before the heap is fixed:
                // sifting dereferences the root slot.
                let new_ref = self.container()?.append_row(&next)?;
                self.row_ptrs[0] = new_ref;
                self.heap_sift_down(0)?;
            }
        }
        self.note_buffered_rows(self.container()?.num_rows());
        Ok(())
    }

    /// Copy live rows into a fresh container and drop the old one, bounding
    /// the garbage accumulated by root replacement.
    fn do_compaction(&mut self) -> ExecResult<()> {
        let old = Arc::clone(self.container()?);
        let fresh = self.new_container();
        let mut new_ptrs = Vec::with_capacity(self.row_ptrs.len());
        for &row_ref in &self.row_ptrs {
            let row = old.get_row(row_ref)?;
            new_ptrs.push(fresh.append_row(&row)?);
        }
        old.close()?;
        self.row_container = Some(fresh);
        // same positional order, so the heap shape is preserved
        self.row_ptrs = new_ptrs;
        self.charge_ptrs();
        Ok(())
    }

    fn execute_topn(&mut self, ctx: &ExecContext) -> ExecResult<()> {
        self.heap_init()?;
        while self.row_ptrs.len() > self.total_limit {
            self.heap_pop_root()?;
        }

        let schema = self.child.schema();
        let max_batch_size = self.max_batch_size;
        let compaction_factor = self.compaction_factor;
        loop {
            ctx.check_cancelled()?;
            let mut builder = ChunkBuilder::new(Arc::clone(&schema), max_batch_size)?;
            self.child.next(ctx, &mut builder)?;
            if builder.is_empty() {
                break;
            }
            if self.row_ptrs.is_empty() {
                continue;
            }
            let chunk = builder.finish()?;
            self.process_child_chunk(chunk)?;
            if self.container()?.num_rows() > self.row_ptrs.len() * compaction_factor {
                self.do_compaction()?;
            }
        }

        // final ordering pass over the survivors
        let mut entries = Vec::with_capacity(self.row_ptrs.len());
        for &row_ref in &self.row_ptrs {
            entries.push((row_ref, self.row_at(row_ref)?));
        }
        entries.sort_by(|(_, a), (_, b)| self.compare_rows(a, b));
        self.row_ptrs = entries.into_iter().map(|(row_ref, _)| row_ref).collect();
        self.charge_ptrs();
        Ok(())
    }
}

impl Executor for TopNExecutor {
    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn open(&mut self, ctx: &ExecContext) -> ExecResult<()> {
        self.child.open(ctx)?;
        if self.mem_tracker.is_none() {
            self.mem_tracker = Some(MemTracker::new_child("top-n executor", ctx.mem_tracker()));
        }
        self.idx = 0;
        self.fetched = false;
        self.closed = false;
        self.peak_buffered_rows = 0;
        Ok(())
    }

    fn next(&mut self, ctx: &ExecContext, out: &mut ChunkBuilder) -> ExecResult<()> {
        out.reset();
        if !self.fetched {
            self.init_compare_funcs()?;
            self.total_limit = self.offset.saturating_add(self.count);
            if self.total_limit > 0 {
                self.load_chunks_until_total_limit(ctx)?;
                self.execute_topn(ctx)?;
            }
            self.idx = self.offset;
            self.fetched = true;
        }
        while !out.is_full() && self.idx < self.row_ptrs.len() {
            let row = self.row_at(self.row_ptrs[self.idx])?;
            out.append_row(&row)?;
            self.idx += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err: Option<ExecError> = None;
        if let Some(container) = self.row_container.take() {
            if let Err(err) = container.close() {
                first_err.get_or_insert(err);
            }
        }
        self.row_ptrs = Vec::new();
        self.release_ptr_charge();
        if let Err(err) = self.child.close() {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
