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
//! In-memory ordered sequence of chunks.
//!
//! Whole chunks are appended as-is (the list takes ownership); single rows
//! are copied into a tail builder that is sealed into a chunk once it reaches
//! the per-chunk row cap, or earlier when chunk indices must stabilize
//! (whole-chunk append, freeze, spill). Reads that land in the unsealed tail
//! are served from a cached snapshot of the builder.
//!
//! Memory is charged to the list's tracker when a chunk is added or the tail
//! is sealed, and released on clear.

use std::sync::Arc;
use std::sync::Mutex;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::{Chunk, ChunkBuilder, Row, RowRef};
use crate::exec::error::{ExecError, ExecResult};
use crate::runtime::mem_tracker::MemTracker;

pub struct ChunkList {
    schema: SchemaRef,
    max_chunk_size: usize,
    mem_tracker: Arc<MemTracker>,
    inner: Mutex<ListInner>,
}

struct ListInner {
    chunks: Vec<Chunk>,
    num_rows: usize,
    charged_bytes: i64,
    tail: Option<ChunkBuilder>,
    tail_snapshot: Option<Chunk>,
}

impl ChunkList {
    pub fn new(
        schema: SchemaRef,
        max_chunk_size: usize,
        mem_tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            schema,
            max_chunk_size: max_chunk_size.max(1),
            mem_tracker,
            inner: Mutex::new(ListInner {
                chunks: Vec::new(),
                num_rows: 0,
                charged_bytes: 0,
                tail: None,
                tail_snapshot: None,
            }),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Append a whole chunk, taking ownership. The tail is sealed first so
    /// previously issued row refs keep addressing the same rows.
    pub fn add_chunk(&self, chunk: Chunk) -> ExecResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.seal_tail_locked(&mut inner)?;
        let bytes = chunk.estimated_bytes() as i64;
        inner.num_rows += chunk.num_rows();
        inner.chunks.push(chunk);
        inner.charged_bytes += bytes;
        self.mem_tracker.consume(bytes);
        Ok(())
    }

    /// Copy one row into the tail builder and return its position.
    pub fn append_row(&self, row: &Row) -> ExecResult<RowRef> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner
            .tail
            .as_ref()
            .is_some_and(|tail| tail.num_rows() >= self.max_chunk_size)
        {
            self.seal_tail_locked(&mut inner)?;
        }
        if inner.tail.is_none() {
            inner.tail = Some(ChunkBuilder::new(
                Arc::clone(&self.schema),
                self.max_chunk_size,
            )?);
        }
        let chunk_idx = inner.chunks.len();
        let tail = inner.tail.as_mut().expect("tail builder present");
        tail.append_row(row)?;
        let row_idx = tail.num_rows() - 1;
        inner.tail_snapshot = None;
        inner.num_rows += 1;
        Ok(RowRef::new(chunk_idx, row_idx))
    }

    pub fn get_row(&self, row_ref: RowRef) -> ExecResult<Row> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let chunk_idx = row_ref.chunk_idx as usize;
        if chunk_idx < inner.chunks.len() {
            return inner.chunks[chunk_idx].get_row(row_ref.row_idx as usize);
        }
        if chunk_idx == inner.chunks.len() && inner.tail.is_some() {
            let snapshot = Self::tail_snapshot_locked(&mut inner)?;
            return snapshot.get_row(row_ref.row_idx as usize);
        }
        Err(ExecError::Internal(format!(
            "row ref ({}, {}) out of bounds for list with {} chunks",
            row_ref.chunk_idx,
            row_ref.row_idx,
            inner.chunks.len()
        )))
    }

    pub fn get_chunk(&self, chunk_idx: usize) -> ExecResult<Chunk> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if chunk_idx < inner.chunks.len() {
            return Ok(inner.chunks[chunk_idx].clone());
        }
        if chunk_idx == inner.chunks.len() && inner.tail.is_some() {
            return Self::tail_snapshot_locked(&mut inner);
        }
        Err(ExecError::Internal(format!(
            "chunk index {chunk_idx} out of bounds"
        )))
    }

    pub fn num_rows(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.num_rows
    }

    pub fn num_chunks(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks.len() + usize::from(inner.tail.as_ref().is_some_and(|t| !t.is_empty()))
    }

    pub fn num_rows_of_chunk(&self, chunk_idx: usize) -> ExecResult<usize> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if chunk_idx < inner.chunks.len() {
            return Ok(inner.chunks[chunk_idx].num_rows());
        }
        if chunk_idx == inner.chunks.len() {
            if let Some(tail) = inner.tail.as_ref() {
                return Ok(tail.num_rows());
            }
        }
        Err(ExecError::Internal(format!(
            "chunk index {chunk_idx} out of bounds"
        )))
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Seal the tail builder into a regular chunk. Row refs into the tail
    /// stay valid: the sealed chunk lands exactly at the index they carry.
    pub fn seal_tail(&self) -> ExecResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.seal_tail_locked(&mut inner)
    }

    fn seal_tail_locked(&self, inner: &mut ListInner) -> ExecResult<()> {
        let Some(mut tail) = inner.tail.take() else {
            return Ok(());
        };
        inner.tail_snapshot = None;
        if tail.is_empty() {
            return Ok(());
        }
        let chunk = tail.finish()?;
        let bytes = chunk.estimated_bytes() as i64;
        inner.chunks.push(chunk);
        inner.charged_bytes += bytes;
        self.mem_tracker.consume(bytes);
        Ok(())
    }

    fn tail_snapshot_locked(inner: &mut ListInner) -> ExecResult<Chunk> {
        if let Some(snapshot) = inner.tail_snapshot.as_ref() {
            return Ok(snapshot.clone());
        }
        let tail = inner
            .tail
            .as_ref()
            .ok_or_else(|| ExecError::Internal("tail builder is missing".to_string()))?;
        let snapshot = tail.finish_cloned()?;
        inner.tail_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop all rows and return the tracker to its pre-append level.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks.clear();
        inner.tail = None;
        inner.tail_snapshot = None;
        inner.num_rows = 0;
        let charged = std::mem::take(&mut inner.charged_bytes);
        self.mem_tracker.release(charged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

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

    #[test]
    fn row_count_equals_sum_over_chunks() {
        let list = ChunkList::new(int_schema(), 4, MemTracker::new_root("list"));
        list.add_chunk(int_chunk(&[1, 2, 3])).expect("add");
        list.add_chunk(int_chunk(&[4])).expect("add");
        assert_eq!(list.num_rows(), 4);
        assert_eq!(list.num_chunks(), 2);
        let mut total = 0;
        for i in 0..list.num_chunks() {
            total += list.num_rows_of_chunk(i).expect("rows of chunk");
        }
        assert_eq!(total, list.num_rows());
    }

    #[test]
    fn append_row_reads_back_through_tail_snapshot() {
        let list = ChunkList::new(int_schema(), 2, MemTracker::new_root("list"));
        let source = int_chunk(&[10, 20, 30]);
        let mut refs = Vec::new();
        for i in 0..3 {
            let row = source.get_row(i).expect("row");
            refs.push(list.append_row(&row).expect("append"));
        }
        // cap of 2 rows: first chunk sealed, third row in the tail
        assert_eq!(refs[0], RowRef::new(0, 0));
        assert_eq!(refs[1], RowRef::new(0, 1));
        assert_eq!(refs[2], RowRef::new(1, 0));
        for (row_ref, want) in refs.iter().zip([10, 20, 30]) {
            let row = list.get_row(*row_ref).expect("get row");
            assert_eq!(int_value(&row), want);
        }
    }

    #[test]
    fn add_chunk_seals_tail_first() {
        let list = ChunkList::new(int_schema(), 8, MemTracker::new_root("list"));
        let source = int_chunk(&[7]);
        let row_ref = list
            .append_row(&source.get_row(0).expect("row"))
            .expect("append");
        list.add_chunk(int_chunk(&[8, 9])).expect("add");
        assert_eq!(list.num_chunks(), 2);
        assert_eq!(int_value(&list.get_row(row_ref).expect("row")), 7);
        assert_eq!(int_value(&list.get_row(RowRef::new(1, 1)).expect("row")), 9);
    }

    #[test]
    fn clear_returns_tracker_to_baseline() {
        let tracker = MemTracker::new_root("list");
        let list = ChunkList::new(int_schema(), 4, Arc::clone(&tracker));
        list.add_chunk(int_chunk(&[1, 2, 3])).expect("add");
        list.seal_tail().expect("seal");
        assert!(tracker.current() > 0);
        list.clear();
        assert_eq!(tracker.current(), 0);
        assert_eq!(list.num_rows(), 0);
    }
}
