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
//! Disk-backed ordered sequence of chunks.
//!
//! Append-only spill file of raw Arrow IPC messages, one per chunk. The
//! offset table lives in memory; a read seeks to the chunk's offset and
//! decodes it. The most recently decoded chunk is cached since rank-ordered
//! readers tend to hit the same chunk repeatedly. The file is deleted on
//! close.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::{Chunk, Row, RowRef};
use crate::exec::error::{ExecError, ExecResult};
use crate::exec::spill::dir_manager::spill_dir_manager;
use crate::exec::spill::ipc_serde::{IpcSerde, SpillCodec};
use crate::micarocks_logging::warn;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Debug, Clone, Copy)]
struct ChunkSlot {
    offset: u64,
    length: u64,
    num_rows: usize,
}

struct DiskInner {
    file: Option<File>,
    slots: Vec<ChunkSlot>,
    num_rows: usize,
    charged_bytes: i64,
    write_offset: u64,
    cache: Option<(usize, Chunk)>,
    closed: bool,
}

pub struct DiskList {
    schema: SchemaRef,
    path: PathBuf,
    ipc: IpcSerde,
    disk_tracker: Arc<MemTracker>,
    inner: Mutex<DiskInner>,
}

impl DiskList {
    pub fn new(
        schema: SchemaRef,
        codec: SpillCodec,
        disk_tracker: Arc<MemTracker>,
    ) -> ExecResult<Self> {
        let (path, file) = spill_dir_manager()?.create_spill_file()?;
        Ok(Self {
            schema,
            path,
            ipc: IpcSerde::new(codec)?,
            disk_tracker,
            inner: Mutex::new(DiskInner {
                file: Some(file),
                slots: Vec::new(),
                num_rows: 0,
                charged_bytes: 0,
                write_offset: 0,
                cache: None,
                closed: false,
            }),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn disk_tracker(&self) -> &Arc<MemTracker> {
        &self.disk_tracker
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Encode and append one chunk at the end of the file.
    pub fn add_chunk(&self, chunk: &Chunk) -> ExecResult<()> {
        let batch = chunk.to_batch()?;
        let encoded = self.ipc.encode_batch(&batch)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let offset = inner.write_offset;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| ExecError::DiskIo("spill file is closed".to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| ExecError::io("seek spill file for append", e))?;
        file.write_all(&encoded.bytes)
            .map_err(|e| ExecError::io("write spill chunk", e))?;
        let length = encoded.bytes.len() as u64;
        inner.write_offset = offset + length;
        inner.slots.push(ChunkSlot {
            offset,
            length,
            num_rows: encoded.num_rows as usize,
        });
        inner.num_rows += encoded.num_rows as usize;
        inner.charged_bytes += length as i64;
        self.disk_tracker.consume(length as i64);
        Ok(())
    }

    pub fn get_row(&self, row_ref: RowRef) -> ExecResult<Row> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let chunk = self.read_chunk_locked(&mut inner, row_ref.chunk_idx as usize)?;
        chunk.get_row(row_ref.row_idx as usize)
    }

    /// Reconstruct the `chunk_idx`-th chunk from its on-disk message.
    pub fn get_chunk(&self, chunk_idx: usize) -> ExecResult<Chunk> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.read_chunk_locked(&mut inner, chunk_idx)
    }

    fn read_chunk_locked(&self, inner: &mut DiskInner, chunk_idx: usize) -> ExecResult<Chunk> {
        if let Some((cached_idx, chunk)) = inner.cache.as_ref() {
            if *cached_idx == chunk_idx {
                return Ok(chunk.clone());
            }
        }
        let slot = *inner.slots.get(chunk_idx).ok_or_else(|| {
            ExecError::Internal(format!(
                "chunk index {chunk_idx} out of bounds for spilled list with {} chunks",
                inner.slots.len()
            ))
        })?;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| ExecError::DiskIo("spill file is closed".to_string()))?;
        file.seek(SeekFrom::Start(slot.offset))
            .map_err(|e| ExecError::io("seek spill file for read", e))?;
        let mut buf = vec![0u8; slot.length as usize];
        file.read_exact(&mut buf)
            .map_err(|e| ExecError::io("read spill chunk", e))?;
        let batch = self.ipc.decode_batch(Arc::clone(&self.schema), &buf)?;
        let chunk = Chunk::new(batch);
        inner.cache = Some((chunk_idx, chunk.clone()));
        Ok(chunk)
    }

    pub fn num_rows(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.num_rows
    }

    pub fn num_chunks(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.slots.len()
    }

    pub fn num_rows_of_chunk(&self, chunk_idx: usize) -> ExecResult<usize> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .slots
            .get(chunk_idx)
            .map(|slot| slot.num_rows)
            .ok_or_else(|| ExecError::Internal(format!("chunk index {chunk_idx} out of bounds")))
    }

    /// Delete the backing file and return the disk tracker to baseline.
    pub fn close(&self) -> ExecResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.file = None;
        inner.cache = None;
        let charged = std::mem::take(&mut inner.charged_bytes);
        self.disk_tracker.release(charged);
        std::fs::remove_file(&self.path)
            .map_err(|e| ExecError::io("remove spill file", e))
    }
}

impl Drop for DiskList {
    fn drop(&mut self) {
        let closed = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed
        };
        if !closed {
            if let Err(err) = self.close() {
                warn!("dropping spilled list failed to clean up: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    fn test_chunk(ids: &[i64], names: &[&str]) -> Chunk {
        let batch = RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(names.to_vec())),
            ],
        )
        .expect("record batch");
        Chunk::new(batch)
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let tracker = MemTracker::new_root("disk");
        let list =
            DiskList::new(test_schema(), SpillCodec::None, Arc::clone(&tracker)).expect("list");
        let first = test_chunk(&[1, 2], &["a", "b"]);
        let second = test_chunk(&[3], &["c"]);
        list.add_chunk(&first).expect("add");
        list.add_chunk(&second).expect("add");

        assert_eq!(list.num_rows(), 3);
        assert_eq!(list.num_chunks(), 2);
        assert_eq!(list.num_rows_of_chunk(1).expect("rows"), 1);
        assert!(tracker.current() > 0);

        assert_eq!(list.get_chunk(0).expect("chunk").batch, first.batch);
        assert_eq!(list.get_chunk(1).expect("chunk").batch, second.batch);

        let row = list.get_row(RowRef::new(0, 1)).expect("row");
        let ids = row
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("ids");
        assert_eq!(ids.value(row.index()), 2);
    }

    #[test]
    fn close_deletes_file_and_releases_tracker() {
        let tracker = MemTracker::new_root("disk");
        let list =
            DiskList::new(test_schema(), SpillCodec::Lz4, Arc::clone(&tracker)).expect("list");
        list.add_chunk(&test_chunk(&[1], &["x"])).expect("add");
        let path = list.path().clone();
        assert!(path.exists());
        list.close().expect("close");
        assert!(!path.exists());
        assert_eq!(tracker.current(), 0);
        // close is idempotent
        list.close().expect("close again");
    }

    #[test]
    fn drop_cleans_up_backing_file() {
        let path = {
            let tracker = MemTracker::new_root("disk");
            let list = DiskList::new(test_schema(), SpillCodec::None, tracker).expect("list");
            list.add_chunk(&test_chunk(&[1], &["x"])).expect("add");
            list.path().clone()
        };
        assert!(!path.exists());
    }
}
