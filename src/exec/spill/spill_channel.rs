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
//! Background executor for spill disk IO.
//!
//! OOM actions must return promptly to the thread that tripped the memory
//! limit, so they only enqueue work here. Worker threads drain the queue and
//! perform the actual writes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::common::config::{spill_io_queue_size, spill_io_threads};
use crate::micarocks_logging::error;

pub type SpillTask = Box<dyn FnOnce() -> Result<(), crate::exec::error::ExecError> + Send + 'static>;

pub struct SpillIoExecutor {
    inner: Arc<SpillIoExecutorInner>,
    #[allow(dead_code)]
    workers: Vec<thread::JoinHandle<()>>,
}

impl SpillIoExecutor {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Self {
        let capacity = queue_capacity.max(1);
        let inner = Arc::new(SpillIoExecutorInner::new(capacity));
        let threads = num_threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let inner_clone = Arc::clone(&inner);
            workers.push(thread::spawn(move || worker_loop(inner_clone)));
        }
        Self { inner, workers }
    }

    /// Enqueue a task; returns false when the queue is at capacity.
    pub fn submit(&self, task: SpillTask) -> bool {
        self.inner.submit(task)
    }

    /// Enqueue a task regardless of the capacity bound.
    pub fn force_submit(&self, task: SpillTask) {
        self.inner.force_submit(task);
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.num_tasks()
    }
}

struct SpillIoExecutorInner {
    queue: Mutex<VecDeque<SpillTask>>,
    cv: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl SpillIoExecutorInner {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn submit(&self, task: SpillTask) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = self.queue.lock().expect("spill io executor queue lock");
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(task);
        self.cv.notify_one();
        true
    }

    fn force_submit(&self, task: SpillTask) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.queue.lock().expect("spill io executor queue lock");
        queue.push_back(task);
        self.cv.notify_one();
    }

    fn num_tasks(&self) -> usize {
        let queue = self.queue.lock().expect("spill io executor queue lock");
        queue.len()
    }

    fn take(&self) -> Option<SpillTask> {
        let mut queue = self.queue.lock().expect("spill io executor queue lock");
        while queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            queue = self
                .cv
                .wait(queue)
                .expect("spill io executor queue condvar wait");
        }
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        queue.pop_front()
    }
}

fn worker_loop(inner: Arc<SpillIoExecutorInner>) {
    while let Some(task) = inner.take() {
        if let Err(err) = task() {
            error!("spill task failed: {}", err);
        }
    }
}

static SPILL_IO_EXECUTOR: OnceLock<SpillIoExecutor> = OnceLock::new();

pub fn spill_io_executor() -> &'static SpillIoExecutor {
    SPILL_IO_EXECUTOR.get_or_init(|| {
        let threads = spill_io_threads();
        let queue_capacity = spill_io_queue_size();
        SpillIoExecutor::new(threads, queue_capacity)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    impl SpillIoExecutor {
        fn new_for_test(queue_capacity: usize) -> Self {
            let inner = Arc::new(SpillIoExecutorInner::new(queue_capacity));
            Self {
                inner,
                workers: Vec::new(),
            }
        }
    }

    #[test]
    fn submit_respects_capacity() {
        let exec = SpillIoExecutor::new_for_test(1);
        assert!(exec.submit(Box::new(|| Ok(()))));
        assert!(!exec.submit(Box::new(|| Ok(()))));
        exec.force_submit(Box::new(|| Ok(())));
        assert_eq!(exec.num_tasks(), 2);
    }

    #[test]
    fn workers_drain_the_queue() {
        let exec = SpillIoExecutor::new(1, 4);
        let (tx, rx) = mpsc::channel::<u32>();
        exec.force_submit(Box::new(move || {
            let _ = tx.send(7);
            Ok(())
        }));
        let got = rx.recv_timeout(Duration::from_secs(2)).expect("task ran");
        assert_eq!(got, 7);
    }
}
