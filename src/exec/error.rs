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
use std::fmt;

pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors for the sort/top-n core.
///
/// Only `AlreadySorted` has a documented recovery: the sort executor catches
/// it, rolls over to a fresh partition container and retries the append.
/// Everything else is surfaced to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The child operator failed to produce a chunk.
    Child(String),
    /// A spill file write or read failed. Stored inside the container that
    /// attempted the spill and re-surfaced on subsequent operations.
    DiskIo(String),
    /// Append to a sorted row container that has been frozen.
    AlreadySorted,
    /// Row-wise append to a container that has spilled to disk.
    AppendRowAfterSpill,
    /// The query was cancelled between child chunks.
    Cancelled,
    /// Invariant violation or unsupported input.
    Internal(String),
}

impl ExecError {
    pub fn io(what: &str, err: std::io::Error) -> Self {
        ExecError::DiskIo(format!("{what} failed: {err}"))
    }

    pub fn arrow(what: &str, err: arrow::error::ArrowError) -> Self {
        ExecError::Internal(format!("{what} failed: {err}"))
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Child(msg) => write!(f, "child operator error: {msg}"),
            ExecError::DiskIo(msg) => write!(f, "spill disk io error: {msg}"),
            ExecError::AlreadySorted => {
                write!(f, "cannot append: the sorted row container is already sorted")
            }
            ExecError::AppendRowAfterSpill => {
                write!(f, "cannot append a single row to a spilled row container")
            }
            ExecError::Cancelled => write!(f, "query cancelled"),
            ExecError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}
