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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::runtime::oom_action::{OomAction, rearrange_fallback};

/// Tracks logical memory usage for a component and its ancestors.
///
/// This is a lightweight accounting utility that only records bytes
/// explicitly reported by the caller. It does NOT reflect real process RSS or
/// allocator statistics. A tracker may carry a byte limit; crossing it fires
/// the head of the tracker's OOM action chain on the consuming thread.
///
/// Disk usage of spilled containers is accounted with plain trackers of the
/// same type (no limit, no actions).
pub struct MemTracker {
    label: Mutex<String>,
    limit: AtomicI64,
    parent: Mutex<Option<Arc<MemTracker>>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
    action: Mutex<Option<Arc<dyn OomAction>>>,
}

impl std::fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTracker")
            .field("label", &self.label())
            .field("limit", &self.limit())
            .field("current", &self.current())
            .field("peak", &self.peak())
            .finish()
    }
}

impl MemTracker {
    /// Create a root tracker with no parent and no limit.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: Mutex::new(label.into()),
            limit: AtomicI64::new(-1),
            parent: Mutex::new(None),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
            action: Mutex::new(None),
        })
    }

    /// Create a child tracker attached to the provided parent.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let child = Self::new_root(label);
        child.attach_to(parent);
        child
    }

    pub fn label(&self) -> String {
        self.label
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        let mut guard = self.label.lock().unwrap_or_else(|e| e.into_inner());
        *guard = label.into();
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Set the byte limit; non-positive means unlimited.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let mut out = Vec::new();
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for weak in guard.iter() {
            if let Some(child) = weak.upgrade() {
                out.push(child);
            }
        }
        out
    }

    fn parent_arc(&self) -> Option<Arc<MemTracker>> {
        let guard = self.parent.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Re-parent this tracker. Bytes already consumed move with it, so the
    /// old ancestor chain is debited and the new one is charged.
    pub fn attach_to(self: &Arc<Self>, parent: &Arc<MemTracker>) {
        let moved = self.current();
        let old_parent = {
            let mut guard = self.parent.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(old_parent) = old_parent {
            old_parent.release(moved);
            old_parent.remove_child(self);
        }
        {
            let mut guard = self.parent.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(Arc::clone(parent));
        }
        {
            let mut guard = parent.children.lock().unwrap_or_else(|e| e.into_inner());
            guard.push(Arc::downgrade(self));
        }
        parent.consume(moved);
    }

    fn remove_child(&self, child: &Arc<MemTracker>) {
        let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|weak| match weak.upgrade() {
            Some(existing) => !Arc::ptr_eq(&existing, child),
            None => false,
        });
    }

    /// Increase consumption for this tracker and all ancestors. Any tracker
    /// on the path whose limit is crossed fires its OOM action chain.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let new_value = self.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
        self.update_peak(new_value);
        self.maybe_fire_action(new_value);

        let mut node = self.parent_arc();
        while let Some(tracker) = node {
            let value = tracker.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            tracker.allocated.fetch_add(bytes, Ordering::AcqRel);
            tracker.update_peak(value);
            tracker.maybe_fire_action(value);
            node = tracker.parent_arc();
        }
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        self.current.fetch_sub(bytes, Ordering::AcqRel);
        self.deallocated.fetch_add(bytes, Ordering::AcqRel);
        let mut node = self.parent_arc();
        while let Some(tracker) = node {
            tracker.current.fetch_sub(bytes, Ordering::AcqRel);
            tracker.deallocated.fetch_add(bytes, Ordering::AcqRel);
            node = tracker.parent_arc();
        }
    }

    /// Install `action` as the preferred OOM reaction. The previously
    /// installed chain is kept as fallback, ordered by action priority.
    pub fn fallback_old_and_set_new_action(&self, action: Arc<dyn OomAction>) {
        let mut guard = self.action.lock().unwrap_or_else(|e| e.into_inner());
        let head = guard.take();
        *guard = Some(rearrange_fallback(head, action));
    }

    pub fn oom_action(&self) -> Option<Arc<dyn OomAction>> {
        let guard = self.action.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    fn maybe_fire_action(&self, new_value: i64) {
        let limit = self.limit();
        if limit <= 0 || new_value <= limit {
            return;
        }
        let action = self.oom_action();
        if let Some(action) = action {
            action.action(self);
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}
