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
//! Columnar row batches and row views.
//!
//! A `Chunk` is an immutable group of rows sharing one schema, wrapped around
//! an Arrow `RecordBatch`. An optional selection vector hides rows without
//! copying column data. `Row` is a cheap owned view onto one row of a batch;
//! `RowRef` addresses a row inside a row container by (chunk, row) index.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow::buffer::Buffer;
use arrow::compute::take;
use arrow::datatypes::SchemaRef;

use crate::exec::error::{ExecError, ExecResult};

pub mod chunk_builder;
pub mod compare;

pub use chunk_builder::ChunkBuilder;
pub use compare::{CompareFunc, get_compare_func};

/// A chunk of data, consisting of multiple rows over Arrow columns.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    selection: Option<Arc<Vec<u32>>>,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            selection: None,
        }
    }

    /// Restrict the chunk to the given physical row indices, in order,
    /// without copying column data.
    pub fn with_selection(self, selection: Vec<u32>) -> ExecResult<Self> {
        let physical_rows = self.batch.num_rows();
        for idx in &selection {
            if *idx as usize >= physical_rows {
                return Err(ExecError::Internal(format!(
                    "selection index {idx} out of bounds for chunk with {physical_rows} rows"
                )));
            }
        }
        Ok(Self {
            batch: self.batch,
            selection: Some(Arc::new(selection)),
        })
    }

    pub fn selection(&self) -> Option<&[u32]> {
        self.selection.as_ref().map(|s| s.as_slice())
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    /// Visible row count (selection-aware).
    pub fn num_rows(&self) -> usize {
        match self.selection.as_ref() {
            Some(selection) => selection.len(),
            None => self.batch.num_rows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Returns the `idx`-th visible row.
    pub fn get_row(&self, idx: usize) -> ExecResult<Row> {
        let physical = match self.selection.as_ref() {
            Some(selection) => *selection.get(idx).ok_or_else(|| {
                ExecError::Internal(format!(
                    "row index {idx} out of bounds for selection of {} rows",
                    selection.len()
                ))
            })? as usize,
            None => {
                if idx >= self.batch.num_rows() {
                    return Err(ExecError::Internal(format!(
                        "row index {idx} out of bounds for chunk with {} rows",
                        self.batch.num_rows()
                    )));
                }
                idx
            }
        };
        Ok(Row::new(self.batch.clone(), physical))
    }

    /// The chunk as a plain record batch; a selection is materialized here.
    pub fn to_batch(&self) -> ExecResult<RecordBatch> {
        let Some(selection) = self.selection.as_ref() else {
            return Ok(self.batch.clone());
        };
        let indices = UInt32Array::from(selection.as_ref().clone());
        let columns = self
            .batch
            .columns()
            .iter()
            .map(|c| take(c.as_ref(), &indices, None))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExecError::arrow("materialize chunk selection", e))?;
        RecordBatch::try_new(self.batch.schema(), columns)
            .map_err(|e| ExecError::arrow("rebuild selected chunk", e))
    }

    pub fn estimated_bytes(&self) -> usize {
        record_batch_bytes(&self.batch)
    }
}

/// An owned view onto a single row. Cheap to clone: columns are Arc-backed.
#[derive(Debug, Clone)]
pub struct Row {
    batch: RecordBatch,
    idx: usize,
}

impl Row {
    pub fn new(batch: RecordBatch, idx: usize) -> Self {
        Self { batch, idx }
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column(&self, col: usize) -> &ArrayRef {
        self.batch.column(col)
    }

    pub fn is_null(&self, col: usize) -> bool {
        self.batch.column(col).is_null(self.idx)
    }
}

/// Position of a row inside a row container: (chunk index, row index).
///
/// Stable until the owning container is reset or closed; spilling keeps the
/// addressing intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowRef {
    pub chunk_idx: u32,
    pub row_idx: u32,
}

impl RowRef {
    pub fn new(chunk_idx: usize, row_idx: usize) -> Self {
        Self {
            chunk_idx: u32::try_from(chunk_idx).unwrap_or(u32::MAX),
            row_idx: u32::try_from(row_idx).unwrap_or(u32::MAX),
        }
    }
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single batch; slices shared across
/// batches are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn int64_chunk(values: &[i64]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
                .expect("record batch");
        Chunk::new(batch)
    }

    #[test]
    fn selection_hides_rows_without_copying() {
        let chunk = int64_chunk(&[10, 20, 30, 40])
            .with_selection(vec![3, 1])
            .expect("selection");
        assert_eq!(chunk.num_rows(), 2);
        let row = chunk.get_row(0).expect("row");
        let col = row
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column");
        assert_eq!(col.value(row.index()), 40);

        let batch = chunk.to_batch().expect("materialize");
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column");
        assert_eq!(col.values(), &[40, 20]);
    }

    #[test]
    fn selection_rejects_out_of_bounds_index() {
        let err = int64_chunk(&[1, 2]).with_selection(vec![2]).unwrap_err();
        assert!(matches!(err, ExecError::Internal(_)));
    }

    #[test]
    fn get_row_checks_bounds() {
        let chunk = int64_chunk(&[1]);
        assert!(chunk.get_row(0).is_ok());
        assert!(chunk.get_row(1).is_err());
    }

    #[test]
    fn estimated_bytes_is_positive_for_non_empty_chunk() {
        assert!(int64_chunk(&[1, 2, 3]).estimated_bytes() > 0);
    }
}
