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
//! Scan source over in-memory chunks.
//!
//! Feeds preset chunks to a parent operator, honoring the parent's
//! required-rows hint. An optional callback runs before every `next` call so
//! harnesses can gate delivery on external state.

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::{Chunk, ChunkBuilder};
use crate::exec::error::ExecResult;
use crate::exec::operators::{ExecContext, Executor};

pub struct MemScanExecutor {
    schema: SchemaRef,
    chunks: Vec<Chunk>,
    chunk_idx: usize,
    row_idx: usize,
    before_next: Option<Box<dyn FnMut() + Send>>,
}

impl MemScanExecutor {
    pub fn new(schema: SchemaRef, chunks: Vec<Chunk>) -> Self {
        Self {
            schema,
            chunks,
            chunk_idx: 0,
            row_idx: 0,
            before_next: None,
        }
    }

    /// Run `hook` at the top of every `next` call.
    pub fn with_before_next(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.before_next = Some(Box::new(hook));
        self
    }
}

impl Executor for MemScanExecutor {
    fn schema(&self) -> SchemaRef {
        std::sync::Arc::clone(&self.schema)
    }

    fn open(&mut self, _ctx: &ExecContext) -> ExecResult<()> {
        self.chunk_idx = 0;
        self.row_idx = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &ExecContext, out: &mut ChunkBuilder) -> ExecResult<()> {
        if let Some(hook) = self.before_next.as_mut() {
            hook();
        }
        while !out.is_full() && self.chunk_idx < self.chunks.len() {
            let chunk = &self.chunks[self.chunk_idx];
            if self.row_idx >= chunk.num_rows() {
                self.chunk_idx += 1;
                self.row_idx = 0;
                continue;
            }
            let row = chunk.get_row(self.row_idx)?;
            out.append_row(&row)?;
            self.row_idx += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> ExecResult<()> {
        Ok(())
    }
}
