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
//! Per-type row comparison functions for sort keys.
//!
//! A compare function is a total order over one column type. NULL placement
//! is an input here, not negotiated downstream: callers decide nulls-first or
//! nulls-last per sort key. Direction (desc) is applied by the caller by
//! flipping the returned ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    Array, BinaryArray, BooleanArray, Date32Array, Date64Array, Decimal128Array, Float32Array,
    Float64Array, Int8Array, Int16Array, Int32Array, Int64Array, LargeStringArray, StringArray,
    TimestampMicrosecondArray, UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, TimeUnit};

use crate::exec::chunk::Row;
use crate::exec::error::{ExecError, ExecResult};

pub type CompareFunc = Arc<dyn Fn(&Row, usize, &Row, usize) -> Ordering + Send + Sync>;

fn compare_nulls(l: &Row, lcol: usize, r: &Row, rcol: usize, nulls_first: bool) -> Option<Ordering> {
    match (l.is_null(lcol), r.is_null(rcol)) {
        (true, true) => Some(Ordering::Equal),
        (true, false) => Some(if nulls_first {
            Ordering::Less
        } else {
            Ordering::Greater
        }),
        (false, true) => Some(if nulls_first {
            Ordering::Greater
        } else {
            Ordering::Less
        }),
        (false, false) => None,
    }
}

macro_rules! cmp_with {
    ($array_ty:ty, $nulls_first:expr, $cmp:expr) => {{
        let nulls_first = $nulls_first;
        Arc::new(move |l: &Row, lcol: usize, r: &Row, rcol: usize| {
            if let Some(ord) = compare_nulls(l, lcol, r, rcol, nulls_first) {
                return ord;
            }
            // A mismatch between the declared key type and the column is a
            // planner bug; comparison itself is infallible.
            let la = l
                .column(lcol)
                .as_any()
                .downcast_ref::<$array_ty>()
                .expect("sort key column matches declared type");
            let ra = r
                .column(rcol)
                .as_any()
                .downcast_ref::<$array_ty>()
                .expect("sort key column matches declared type");
            let cmp = $cmp;
            cmp(la.value(l.index()), ra.value(r.index()))
        }) as CompareFunc
    }};
}

macro_rules! cmp_ord {
    ($array_ty:ty, $nulls_first:expr) => {
        cmp_with!($array_ty, $nulls_first, |a, b| Ord::cmp(&a, &b))
    };
}

/// Build the comparison function for a sort key of type `dt`.
pub fn get_compare_func(dt: &DataType, nulls_first: bool) -> ExecResult<CompareFunc> {
    let func = match dt {
        DataType::Boolean => cmp_ord!(BooleanArray, nulls_first),
        DataType::Int8 => cmp_ord!(Int8Array, nulls_first),
        DataType::Int16 => cmp_ord!(Int16Array, nulls_first),
        DataType::Int32 => cmp_ord!(Int32Array, nulls_first),
        DataType::Int64 => cmp_ord!(Int64Array, nulls_first),
        DataType::UInt8 => cmp_ord!(UInt8Array, nulls_first),
        DataType::UInt16 => cmp_ord!(UInt16Array, nulls_first),
        DataType::UInt32 => cmp_ord!(UInt32Array, nulls_first),
        DataType::UInt64 => cmp_ord!(UInt64Array, nulls_first),
        DataType::Float32 => {
            cmp_with!(Float32Array, nulls_first, |a: f32, b: f32| a.total_cmp(&b))
        }
        DataType::Float64 => {
            cmp_with!(Float64Array, nulls_first, |a: f64, b: f64| a.total_cmp(&b))
        }
        DataType::Utf8 => cmp_ord!(StringArray, nulls_first),
        DataType::LargeUtf8 => cmp_ord!(LargeStringArray, nulls_first),
        DataType::Binary => cmp_ord!(BinaryArray, nulls_first),
        DataType::Date32 => cmp_ord!(Date32Array, nulls_first),
        DataType::Date64 => cmp_ord!(Date64Array, nulls_first),
        DataType::Decimal128(_, _) => cmp_ord!(Decimal128Array, nulls_first),
        DataType::Timestamp(TimeUnit::Microsecond, None) => {
            cmp_ord!(TimestampMicrosecondArray, nulls_first)
        }
        other => {
            return Err(ExecError::Internal(format!(
                "unsupported sort key type {other}"
            )));
        }
    };
    Ok(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::RecordBatch;
    use arrow::datatypes::{Field, Schema};

    fn int_rows(values: Vec<Option<i64>>) -> Vec<Row> {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.clone()))])
                .expect("record batch");
        (0..values.len()).map(|i| Row::new(batch.clone(), i)).collect()
    }

    #[test]
    fn int_compare_orders_values() {
        let rows = int_rows(vec![Some(3), Some(7)]);
        let cmp = get_compare_func(&DataType::Int64, false).expect("cmp");
        assert_eq!(cmp(&rows[0], 0, &rows[1], 0), Ordering::Less);
        assert_eq!(cmp(&rows[1], 0, &rows[0], 0), Ordering::Greater);
        assert_eq!(cmp(&rows[0], 0, &rows[0], 0), Ordering::Equal);
    }

    #[test]
    fn null_placement_is_an_input() {
        let rows = int_rows(vec![None, Some(1)]);
        let nulls_first = get_compare_func(&DataType::Int64, true).expect("cmp");
        let nulls_last = get_compare_func(&DataType::Int64, false).expect("cmp");
        assert_eq!(nulls_first(&rows[0], 0, &rows[1], 0), Ordering::Less);
        assert_eq!(nulls_last(&rows[0], 0, &rows[1], 0), Ordering::Greater);
        assert_eq!(nulls_first(&rows[0], 0, &rows[0], 0), Ordering::Equal);
    }

    #[test]
    fn float_compare_is_total() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Float64, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float64Array::from(vec![f64::NAN, 1.0]))],
        )
        .expect("record batch");
        let nan = Row::new(batch.clone(), 0);
        let one = Row::new(batch, 1);
        let cmp = get_compare_func(&DataType::Float64, false).expect("cmp");
        assert_eq!(cmp(&nan, 0, &one, 0), Ordering::Greater);
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let dt = DataType::List(Arc::new(Field::new("item", DataType::Int32, true)));
        assert!(get_compare_func(&dt, false).is_err());
    }
}
