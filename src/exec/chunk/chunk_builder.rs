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
//! Row-wise construction of chunks.
//!
//! Executors hand a `ChunkBuilder` to their child as the output buffer; the
//! child appends rows until the builder reports it is full. The
//! `required_rows` hint lets a parent ask for fewer rows than the hard
//! per-chunk cap (top-n prefetch uses this to avoid over-reading).

use std::sync::Arc;

use arrow::array::builder::make_builder;
use arrow::array::{
    Array, ArrayBuilder, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder,
    Date32Array, Date32Builder, Date64Array, Date64Builder, Decimal128Array, Decimal128Builder,
    Float32Array, Float32Builder, Float64Array, Float64Builder, Int8Array, Int8Builder,
    Int16Array, Int16Builder, Int32Array, Int32Builder, Int64Array, Int64Builder,
    LargeStringArray, LargeStringBuilder, RecordBatch, StringArray, StringBuilder,
    TimestampMicrosecondArray, TimestampMicrosecondBuilder, UInt8Array, UInt8Builder,
    UInt16Array, UInt16Builder, UInt32Array, UInt32Builder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, SchemaRef, TimeUnit};

use crate::exec::chunk::{Chunk, Row};
use crate::exec::error::{ExecError, ExecResult};

/// Returns whether the sort/top-n core can hold and copy columns of `dt`.
pub fn is_supported_type(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Binary
            | DataType::Date32
            | DataType::Date64
            | DataType::Decimal128(_, _)
            | DataType::Timestamp(TimeUnit::Microsecond, None)
    )
}

macro_rules! copy_value {
    ($array_ty:ty, $builder_ty:ty, $column:expr, $row_idx:expr, $builder:expr) => {{
        let array = $column
            .as_any()
            .downcast_ref::<$array_ty>()
            .ok_or_else(|| {
                ExecError::Internal(format!(
                    "column type mismatch: expected {}",
                    stringify!($array_ty)
                ))
            })?;
        let builder = $builder
            .as_any_mut()
            .downcast_mut::<$builder_ty>()
            .ok_or_else(|| {
                ExecError::Internal(format!(
                    "builder type mismatch: expected {}",
                    stringify!($builder_ty)
                ))
            })?;
        if array.is_null($row_idx) {
            builder.append_null();
        } else {
            builder.append_value(array.value($row_idx));
        }
    }};
}

pub struct ChunkBuilder {
    schema: SchemaRef,
    builders: Vec<Box<dyn ArrayBuilder>>,
    num_rows: usize,
    max_rows: usize,
    required_rows: usize,
}

impl ChunkBuilder {
    pub fn new(schema: SchemaRef, max_rows: usize) -> ExecResult<Self> {
        for field in schema.fields() {
            if !is_supported_type(field.data_type()) {
                return Err(ExecError::Internal(format!(
                    "unsupported column type {} for field {}",
                    field.data_type(),
                    field.name()
                )));
            }
        }
        let max_rows = max_rows.max(1);
        let builders = schema
            .fields()
            .iter()
            .map(|f| make_builder(f.data_type(), max_rows))
            .collect();
        Ok(Self {
            schema,
            builders,
            num_rows: 0,
            max_rows,
            required_rows: max_rows,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Ask the producer for at most `n` rows in this batch. Values outside
    /// `1..=max_rows` fall back to the hard cap.
    pub fn set_required_rows(&mut self, n: usize) {
        self.required_rows = if n == 0 || n > self.max_rows {
            self.max_rows
        } else {
            n
        };
    }

    pub fn required_rows(&self) -> usize {
        self.required_rows
    }

    pub fn is_full(&self) -> bool {
        self.num_rows >= self.required_rows
    }

    /// Copy one row into the builder.
    pub fn append_row(&mut self, row: &Row) -> ExecResult<()> {
        if row.num_columns() != self.builders.len() {
            return Err(ExecError::Internal(format!(
                "append row with {} columns into builder with {} columns",
                row.num_columns(),
                self.builders.len()
            )));
        }
        for (col, builder) in self.builders.iter_mut().enumerate() {
            append_cell(
                self.schema.field(col).data_type(),
                row.column(col),
                row.index(),
                builder.as_mut(),
            )?;
        }
        self.num_rows += 1;
        Ok(())
    }

    /// Finish the chunk and reset the builder for reuse.
    pub fn finish(&mut self) -> ExecResult<Chunk> {
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(|b| b.finish()).collect();
        self.num_rows = 0;
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .map_err(|e| ExecError::arrow("build chunk from builders", e))?;
        Ok(Chunk::new(batch))
    }

    /// Snapshot the current contents without resetting the builder.
    pub fn finish_cloned(&self) -> ExecResult<Chunk> {
        let arrays: Vec<ArrayRef> = self.builders.iter().map(|b| b.finish_cloned()).collect();
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), arrays)
            .map_err(|e| ExecError::arrow("snapshot chunk from builders", e))?;
        Ok(Chunk::new(batch))
    }

    /// Drop any buffered rows.
    pub fn reset(&mut self) {
        if self.num_rows > 0 {
            for builder in self.builders.iter_mut() {
                let _ = builder.finish();
            }
            self.num_rows = 0;
        }
    }
}

fn append_cell(
    dt: &DataType,
    column: &ArrayRef,
    row_idx: usize,
    builder: &mut dyn ArrayBuilder,
) -> ExecResult<()> {
    match dt {
        DataType::Boolean => copy_value!(BooleanArray, BooleanBuilder, column, row_idx, builder),
        DataType::Int8 => copy_value!(Int8Array, Int8Builder, column, row_idx, builder),
        DataType::Int16 => copy_value!(Int16Array, Int16Builder, column, row_idx, builder),
        DataType::Int32 => copy_value!(Int32Array, Int32Builder, column, row_idx, builder),
        DataType::Int64 => copy_value!(Int64Array, Int64Builder, column, row_idx, builder),
        DataType::UInt8 => copy_value!(UInt8Array, UInt8Builder, column, row_idx, builder),
        DataType::UInt16 => copy_value!(UInt16Array, UInt16Builder, column, row_idx, builder),
        DataType::UInt32 => copy_value!(UInt32Array, UInt32Builder, column, row_idx, builder),
        DataType::UInt64 => copy_value!(UInt64Array, UInt64Builder, column, row_idx, builder),
        DataType::Float32 => copy_value!(Float32Array, Float32Builder, column, row_idx, builder),
        DataType::Float64 => copy_value!(Float64Array, Float64Builder, column, row_idx, builder),
        DataType::Utf8 => copy_value!(StringArray, StringBuilder, column, row_idx, builder),
        DataType::LargeUtf8 => {
            copy_value!(LargeStringArray, LargeStringBuilder, column, row_idx, builder)
        }
        DataType::Binary => copy_value!(BinaryArray, BinaryBuilder, column, row_idx, builder),
        DataType::Date32 => copy_value!(Date32Array, Date32Builder, column, row_idx, builder),
        DataType::Date64 => copy_value!(Date64Array, Date64Builder, column, row_idx, builder),
        DataType::Decimal128(_, _) => {
            copy_value!(Decimal128Array, Decimal128Builder, column, row_idx, builder)
        }
        DataType::Timestamp(TimeUnit::Microsecond, None) => copy_value!(
            TimestampMicrosecondArray,
            TimestampMicrosecondBuilder,
            column,
            row_idx,
            builder
        ),
        other => {
            return Err(ExecError::Internal(format!(
                "unsupported column type {other} in chunk builder"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    fn source_chunk() -> Chunk {
        let batch = RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None, Some(3)])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None])),
            ],
        )
        .expect("record batch");
        Chunk::new(batch)
    }

    #[test]
    fn append_and_finish_round_trip() {
        let source = source_chunk();
        let mut builder = ChunkBuilder::new(test_schema(), 8).expect("builder");
        for idx in 0..source.num_rows() {
            let row = source.get_row(idx).expect("row");
            builder.append_row(&row).expect("append");
        }
        let chunk = builder.finish().expect("finish");
        assert_eq!(chunk.num_rows(), 3);
        assert_eq!(chunk.batch, source.batch);
        // finish resets the builder for reuse
        assert!(builder.is_empty());
    }

    #[test]
    fn finish_cloned_keeps_rows_buffered() {
        let source = source_chunk();
        let mut builder = ChunkBuilder::new(test_schema(), 8).expect("builder");
        builder
            .append_row(&source.get_row(0).expect("row"))
            .expect("append");
        let snapshot = builder.finish_cloned().expect("snapshot");
        assert_eq!(snapshot.num_rows(), 1);
        assert_eq!(builder.num_rows(), 1);
        builder
            .append_row(&source.get_row(1).expect("row"))
            .expect("append");
        assert_eq!(builder.num_rows(), 2);
    }

    #[test]
    fn required_rows_hint_caps_fullness() {
        let mut builder = ChunkBuilder::new(test_schema(), 8).expect("builder");
        builder.set_required_rows(1);
        assert!(!builder.is_full());
        let source = source_chunk();
        builder
            .append_row(&source.get_row(0).expect("row"))
            .expect("append");
        assert!(builder.is_full());
        builder.set_required_rows(0);
        assert_eq!(builder.required_rows(), 8);
    }

    #[test]
    fn rejects_unsupported_schema() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "xs",
            DataType::List(Arc::new(Field::new("item", DataType::Int32, true))),
            true,
        )]));
        assert!(ChunkBuilder::new(schema, 8).is_err());
    }
}
