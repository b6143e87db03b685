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
//! Integration tests for the sort and top-n executors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use micarocks::ExecError;
use micarocks::exec::chunk::{Chunk, ChunkBuilder};
use micarocks::exec::operators::{
    ExecContext, Executor, MemScanExecutor, SortExecutor, SortKey, TopNExecutor,
};

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

fn drain_ints(exec: &mut dyn Executor, ctx: &ExecContext, batch_rows: usize) -> Vec<i64> {
    let mut out = Vec::new();
    loop {
        let mut builder = ChunkBuilder::new(exec.schema(), batch_rows).expect("builder");
        exec.next(ctx, &mut builder).expect("next");
        if builder.is_empty() {
            break;
        }
        let chunk = builder.finish().expect("finish");
        let column = chunk
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column");
        for i in 0..column.len() {
            out.push(column.value(i));
        }
    }
    out
}

#[test]
fn full_in_memory_sort_ascending() {
    let child = MemScanExecutor::new(int_schema(), vec![int_chunk(&[3, 1, 4, 1, 5, 9, 2, 6])]);
    let mut sort = SortExecutor::new(Box::new(child), vec![SortKey::asc(0)]);
    let ctx = ExecContext::new();
    sort.open(&ctx).expect("open");
    assert_eq!(drain_ints(&mut sort, &ctx, 4), vec![1, 1, 2, 3, 4, 5, 6, 9]);
    // end of stream is sticky
    assert!(drain_ints(&mut sort, &ctx, 4).is_empty());
    sort.close().expect("close");
    sort.close().expect("close is idempotent");
    assert_eq!(ctx.mem_tracker().current(), 0);
}

#[test]
fn multi_partition_merge_with_forced_spill() {
    // A one-byte quota makes every buffered group trip the spill action; the
    // child withholds the next group until spill bytes actually land on disk,
    // so each group becomes its own spilled partition.
    let ctx = ExecContext::new();
    ctx.mem_tracker().set_limit(1);

    let disk_tracker = Arc::clone(ctx.disk_tracker());
    let mut first_call = true;
    let mut last_disk = 0i64;
    let child = MemScanExecutor::new(int_schema(), vec![int_chunk(&[3, 1, 4, 1, 5, 9, 2, 6])])
        .with_before_next(move || {
            if first_call {
                first_call = false;
                return;
            }
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                let bytes = disk_tracker.current();
                if bytes > last_disk {
                    last_disk = bytes;
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

    let mut sort =
        SortExecutor::new(Box::new(child), vec![SortKey::asc(0)]).with_max_batch_size(3);
    sort.open(&ctx).expect("open");
    assert_eq!(drain_ints(&mut sort, &ctx, 4), vec![1, 1, 2, 3, 4, 5, 6, 9]);
    assert!(sort.num_partitions() > 1, "expected several sorted runs");
    assert!(sort.num_spilled_partitions() >= 1, "expected spilled runs");
    sort.close().expect("close");
    assert_eq!(ctx.mem_tracker().current(), 0);
    assert_eq!(ctx.disk_tracker().current(), 0);
}

#[test]
fn topn_descending_with_offset() {
    let child = MemScanExecutor::new(int_schema(), vec![int_chunk(&[3, 1, 4, 1, 5, 9, 2, 6])]);
    let mut topn = TopNExecutor::new(Box::new(child), vec![SortKey::desc(0)], 1, 3);
    let ctx = ExecContext::new();
    topn.open(&ctx).expect("open");
    // order desc is [9, 6, 5, 4, ...]; skip one, take three
    assert_eq!(drain_ints(&mut topn, &ctx, 4), vec![6, 5, 4]);
    topn.close().expect("close");
    assert_eq!(ctx.mem_tracker().current(), 0);
}

#[test]
fn topn_compaction_bounds_buffered_rows() {
    // Ascending input under a descending order replaces the heap root on
    // every row, the worst case for container growth.
    let values: Vec<i64> = (1..=100).collect();
    let child = MemScanExecutor::new(int_schema(), vec![int_chunk(&values)]);
    let mut topn = TopNExecutor::new(Box::new(child), vec![SortKey::desc(0)], 0, 3)
        .with_max_batch_size(4)
        .with_compaction_factor(4);
    let ctx = ExecContext::new();
    topn.open(&ctx).expect("open");
    assert_eq!(drain_ints(&mut topn, &ctx, 4), vec![100, 99, 98]);
    // bounded by factor * N plus one child batch of slack
    assert!(
        topn.peak_buffered_rows() <= 4 * 3 + 4,
        "peak {} exceeded the compaction bound",
        topn.peak_buffered_rows()
    );
    topn.close().expect("close");
    assert_eq!(ctx.mem_tracker().current(), 0);
}

#[test]
fn composite_key_sort() {
    let schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("a", DataType::Int64, true),
        Field::new("b", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(vec![1, 1, 2])),
            Arc::new(StringArray::from(vec!["b", "a", "a"])),
        ],
    )
    .expect("record batch");
    let child = MemScanExecutor::new(Arc::clone(&schema), vec![Chunk::new(batch)]);
    let mut sort = SortExecutor::new(Box::new(child), vec![SortKey::asc(0), SortKey::asc(1)]);
    let ctx = ExecContext::new();
    sort.open(&ctx).expect("open");

    let mut rows = Vec::new();
    loop {
        let mut builder = ChunkBuilder::new(sort.schema(), 8).expect("builder");
        sort.next(&ctx, &mut builder).expect("next");
        if builder.is_empty() {
            break;
        }
        let chunk = builder.finish().expect("finish");
        let ids = chunk
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("ids");
        let names = chunk
            .batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("names");
        for i in 0..chunk.num_rows() {
            rows.push((ids.value(i), names.value(i).to_string()));
        }
    }
    assert_eq!(
        rows,
        vec![
            (1, "a".to_string()),
            (1, "b".to_string()),
            (2, "a".to_string())
        ]
    );
    sort.close().expect("close");
}

#[test]
fn empty_input_yields_empty_output() {
    let child = MemScanExecutor::new(int_schema(), Vec::new());
    let mut sort = SortExecutor::new(Box::new(child), vec![SortKey::asc(0)]);
    let ctx = ExecContext::new();
    sort.open(&ctx).expect("open");
    assert!(drain_ints(&mut sort, &ctx, 4).is_empty());
    sort.close().expect("close");

    let child = MemScanExecutor::new(int_schema(), Vec::new());
    let mut topn = TopNExecutor::new(Box::new(child), vec![SortKey::desc(0)], 0, 5);
    let ctx = ExecContext::new();
    topn.open(&ctx).expect("open");
    assert!(drain_ints(&mut topn, &ctx, 4).is_empty());
    topn.close().expect("close");
}

#[test]
fn topn_with_zero_count_is_empty() {
    let child = MemScanExecutor::new(int_schema(), vec![int_chunk(&[5, 1, 2])]);
    let mut topn = TopNExecutor::new(Box::new(child), vec![SortKey::asc(0)], 0, 0);
    let ctx = ExecContext::new();
    topn.open(&ctx).expect("open");
    assert!(drain_ints(&mut topn, &ctx, 4).is_empty());
    topn.close().expect("close");
}

#[test]
fn cancellation_surfaces_between_chunks() {
    let child = MemScanExecutor::new(int_schema(), vec![int_chunk(&[2, 1])]);
    let mut sort = SortExecutor::new(Box::new(child), vec![SortKey::asc(0)]);
    let ctx = ExecContext::new();
    sort.open(&ctx).expect("open");
    ctx.cancel();
    let mut builder = ChunkBuilder::new(sort.schema(), 4).expect("builder");
    let err = sort.next(&ctx, &mut builder).unwrap_err();
    assert_eq!(err, ExecError::Cancelled);
    sort.close().expect("close");
}

#[test]
fn randomized_sort_matches_model() {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut values: Vec<i64> = Vec::with_capacity(500);
    for _ in 0..500 {
        values.push(rng.random_range(-1000..1000));
    }
    let chunks: Vec<Chunk> = values.chunks(37).map(int_chunk).collect();

    let child = MemScanExecutor::new(int_schema(), chunks);
    let mut sort =
        SortExecutor::new(Box::new(child), vec![SortKey::asc(0)]).with_max_batch_size(64);
    let ctx = ExecContext::new();
    sort.open(&ctx).expect("open");
    let got = drain_ints(&mut sort, &ctx, 64);
    sort.close().expect("close");

    let mut want = values;
    want.sort_unstable();
    assert_eq!(got, want);
}

#[test]
fn randomized_topn_matches_model() {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut values: Vec<i64> = Vec::with_capacity(300);
    for _ in 0..300 {
        values.push(rng.random_range(-50..50));
    }
    let chunks: Vec<Chunk> = values.chunks(29).map(int_chunk).collect();

    let child = MemScanExecutor::new(int_schema(), chunks);
    let mut topn = TopNExecutor::new(Box::new(child), vec![SortKey::asc(0)], 5, 20)
        .with_max_batch_size(16);
    let ctx = ExecContext::new();
    topn.open(&ctx).expect("open");
    let got = drain_ints(&mut topn, &ctx, 16);
    topn.close().expect("close");

    let mut want = values;
    want.sort_unstable();
    let want: Vec<i64> = want.into_iter().skip(5).take(20).collect();
    assert_eq!(got, want);
}
