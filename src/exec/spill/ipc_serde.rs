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
//! Arrow IPC message serde for spill files.
//!
//! Each chunk is written as a single self-contained IPC record-batch message
//! so a spilled chunk can be re-read by seeking to its byte offset; the
//! offset table itself stays in memory with the owning disk list.

use std::fmt;

use arrow::array::RecordBatch;
use arrow::buffer::Buffer;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::ipc::reader::FileDecoder;
use arrow::ipc::writer::{
    DictionaryTracker, EncodedData, IpcDataGenerator, IpcWriteOptions, write_message,
};
use arrow::ipc::{Block, CompressionType, MetadataVersion};

use crate::exec::error::{ExecError, ExecResult};

const IPC_ALIGNMENT: usize = 64;
const CONTINUATION_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    pub fn from_str(value: &str) -> ExecResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "none" => Ok(SpillCodec::None),
            "lz4" => Ok(SpillCodec::Lz4),
            "zstd" => Ok(SpillCodec::Zstd),
            _ => Err(ExecError::Internal(format!(
                "unsupported spill ipc compression: {value}"
            ))),
        }
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillCodec::None => write!(f, "none"),
            SpillCodec::Lz4 => write!(f, "lz4"),
            SpillCodec::Zstd => write!(f, "zstd"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub bytes: Vec<u8>,
    pub num_rows: u32,
}

#[derive(Debug, Clone)]
pub struct IpcSerde {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl IpcSerde {
    pub fn new(codec: SpillCodec) -> ExecResult<Self> {
        let write_options = build_ipc_write_options(codec)?;
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode_batch(&self, batch: &RecordBatch) -> ExecResult<EncodedChunk> {
        if has_dictionary(batch.schema().as_ref()) {
            return Err(ExecError::Internal(
                "dictionary-encoded columns are not supported in spill files".to_string(),
            ));
        }

        let data_gen = IpcDataGenerator::default();
        let mut dictionary_tracker = DictionaryTracker::new(false);
        let (encoded_dictionaries, encoded_message) = data_gen
            .encoded_batch(batch, &mut dictionary_tracker, &self.write_options)
            .map_err(map_arrow_err)?;

        if !encoded_dictionaries.is_empty() {
            return Err(ExecError::Internal(
                "dictionary batch messages are not supported in spill files".to_string(),
            ));
        }

        let bytes = write_encoded_message(encoded_message, &self.write_options)?;
        let num_rows = u32::try_from(batch.num_rows()).map_err(|_| {
            ExecError::Internal("record batch row count overflows u32".to_string())
        })?;
        Ok(EncodedChunk { bytes, num_rows })
    }

    pub fn decode_batch(&self, schema: SchemaRef, message: &[u8]) -> ExecResult<RecordBatch> {
        let metadata_len = ipc_metadata_len(message, IPC_ALIGNMENT)?;
        if metadata_len > message.len() {
            return Err(ExecError::DiskIo(
                "spill message metadata length exceeds buffer size".to_string(),
            ));
        }
        let body_len = message.len() - metadata_len;
        let block = Block::new(0, metadata_len as i32, body_len as i64);
        let buffer = Buffer::from(message.to_vec());
        let decoder = FileDecoder::new(schema, MetadataVersion::V5);
        decoder
            .read_record_batch(&block, &buffer)
            .map_err(map_arrow_err)?
            .ok_or_else(|| {
                ExecError::DiskIo("spill message did not contain a record batch".to_string())
            })
    }
}

fn build_ipc_write_options(codec: SpillCodec) -> ExecResult<IpcWriteOptions> {
    let options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)
        .map_err(map_arrow_err)?;
    match codec {
        SpillCodec::None => Ok(options),
        SpillCodec::Lz4 => options
            .try_with_compression(Some(CompressionType::LZ4_FRAME))
            .map_err(map_arrow_err),
        SpillCodec::Zstd => options
            .try_with_compression(Some(CompressionType::ZSTD))
            .map_err(map_arrow_err),
    }
}

fn write_encoded_message(
    encoded: EncodedData,
    options: &IpcWriteOptions,
) -> ExecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let (meta, body) = write_message(&mut buffer, encoded, options).map_err(map_arrow_err)?;
    let total = meta + body;
    if buffer.len() != total {
        return Err(ExecError::DiskIo(format!(
            "spill message length mismatch: expected {total} bytes, got {}",
            buffer.len()
        )));
    }
    Ok(buffer)
}

fn ipc_metadata_len(message: &[u8], alignment: usize) -> ExecResult<usize> {
    if message.len() < 4 {
        return Err(ExecError::DiskIo(
            "spill message is too small to contain a header".to_string(),
        ));
    }
    let (prefix_size, meta_len) = if message.len() >= 8 && message[..4] == CONTINUATION_MARKER {
        let len = i32::from_le_bytes(message[4..8].try_into().expect("4 bytes"));
        if len < 0 {
            return Err(ExecError::DiskIo(
                "spill message has negative metadata length".to_string(),
            ));
        }
        (8usize, len as usize)
    } else {
        let len = i32::from_le_bytes(message[..4].try_into().expect("4 bytes"));
        if len < 0 {
            return Err(ExecError::DiskIo(
                "spill message has negative metadata length".to_string(),
            ));
        }
        (4usize, len as usize)
    };

    let raw = prefix_size
        .checked_add(meta_len)
        .ok_or_else(|| ExecError::DiskIo("spill message metadata length overflow".to_string()))?;
    Ok(align_up(raw, alignment))
}

fn align_up(value: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (value + mask) & !mask
}

fn has_dictionary(schema: &arrow::datatypes::Schema) -> bool {
    fn walk(dt: &arrow::datatypes::DataType) -> bool {
        use arrow::datatypes::DataType;
        match dt {
            DataType::Dictionary(_, _) => true,
            DataType::List(field)
            | DataType::LargeList(field)
            | DataType::FixedSizeList(field, _)
            | DataType::Map(field, _) => walk(field.data_type()),
            DataType::Struct(fields) => fields.iter().any(|f| walk(f.data_type())),
            _ => false,
        }
    }
    schema.fields().iter().any(|f| walk(f.data_type()))
}

fn map_arrow_err(err: ArrowError) -> ExecError {
    ExecError::DiskIo(format!("spill ipc codec failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("x"), None, Some("z")])),
            ],
        )
        .expect("record batch")
    }

    #[test]
    fn encode_decode_round_trip() {
        for codec in [SpillCodec::None, SpillCodec::Lz4, SpillCodec::Zstd] {
            let serde = IpcSerde::new(codec).expect("serde");
            let batch = test_batch();
            let encoded = serde.encode_batch(&batch).expect("encode");
            assert_eq!(encoded.num_rows, 3);
            let decoded = serde
                .decode_batch(batch.schema(), &encoded.bytes)
                .expect("decode");
            assert_eq!(decoded, batch);
        }
    }

    #[test]
    fn codec_parses_from_config_string() {
        assert_eq!(SpillCodec::from_str(" LZ4 ").expect("codec"), SpillCodec::Lz4);
        assert!(SpillCodec::from_str("snappy").is_err());
    }
}
