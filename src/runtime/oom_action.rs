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
//! Reactions to a memory tracker exceeding its byte limit.
//!
//! Actions form a fallback chain ordered by priority. When a tracker's limit
//! is breached it invokes the head of the chain; an action that has already
//! done its work (or cannot act) delegates to its fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::micarocks_logging::warn;
use crate::runtime::mem_tracker::MemTracker;

pub const PRIORITY_PANIC: i64 = 0;
pub const PRIORITY_LOG: i64 = 1;
pub const PRIORITY_SPILL: i64 = 2;
pub const PRIORITY_RATE_LIMIT: i64 = 3;

/// Message carried by the panic raised when no action can relieve pressure.
pub const PANIC_MEMORY_EXCEED: &str = "out of memory quota!";

/// A reaction to a tracker exceeding its limit.
///
/// Implementations must be thread-safe: the action fires on whichever thread
/// performed the consumption that crossed the limit.
pub trait OomAction: Send + Sync {
    fn action(&self, tracker: &MemTracker);
    fn set_fallback(&self, fallback: Arc<dyn OomAction>);
    fn fallback(&self) -> Option<Arc<dyn OomAction>>;
    fn priority(&self) -> i64;
}

/// Shared fallback slot for action implementations.
#[derive(Default)]
pub struct FallbackSlot {
    inner: Mutex<Option<Arc<dyn OomAction>>>,
}

impl FallbackSlot {
    pub fn set(&self, fallback: Arc<dyn OomAction>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(fallback);
    }

    pub fn get(&self) -> Option<Arc<dyn OomAction>> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    pub fn delegate(&self, tracker: &MemTracker) {
        if let Some(fallback) = self.get() {
            fallback.action(tracker);
        }
    }
}

/// Inserts `new_action` into the chain headed by `head`, keeping the chain
/// ordered by descending priority so the highest-priority action fires first.
pub(crate) fn rearrange_fallback(
    head: Option<Arc<dyn OomAction>>,
    new_action: Arc<dyn OomAction>,
) -> Arc<dyn OomAction> {
    match head {
        None => new_action,
        Some(head) => {
            if head.priority() < new_action.priority() {
                new_action.set_fallback(head);
                new_action
            } else {
                let tail = rearrange_fallback(head.fallback(), new_action);
                head.set_fallback(tail);
                head
            }
        }
    }
}

/// Warns once when memory usage exceeds the quota, then steps aside.
#[derive(Default)]
pub struct LogOnceAction {
    acted: AtomicBool,
    fallback: FallbackSlot,
}

impl LogOnceAction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl OomAction for LogOnceAction {
    fn action(&self, tracker: &MemTracker) {
        if self.acted.swap(true, Ordering::AcqRel) {
            self.fallback.delegate(tracker);
            return;
        }
        warn!(
            "memory exceeds quota: label={} consumed={} limit={}",
            tracker.label(),
            tracker.current(),
            tracker.limit()
        );
    }

    fn set_fallback(&self, fallback: Arc<dyn OomAction>) {
        self.fallback.set(fallback);
    }

    fn fallback(&self) -> Option<Arc<dyn OomAction>> {
        self.fallback.get()
    }

    fn priority(&self) -> i64 {
        PRIORITY_LOG
    }
}

/// Last-resort action: panics out of the executing query.
#[derive(Default)]
pub struct PanicAction {
    acted: AtomicBool,
    fallback: FallbackSlot,
}

impl PanicAction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl OomAction for PanicAction {
    fn action(&self, tracker: &MemTracker) {
        if self.acted.swap(true, Ordering::AcqRel) {
            return;
        }
        panic!(
            "{PANIC_MEMORY_EXCEED} label={} consumed={} limit={}",
            tracker.label(),
            tracker.current(),
            tracker.limit()
        );
    }

    fn set_fallback(&self, fallback: Arc<dyn OomAction>) {
        self.fallback.set(fallback);
    }

    fn fallback(&self) -> Option<Arc<dyn OomAction>> {
        self.fallback.get()
    }

    fn priority(&self) -> i64 {
        PRIORITY_PANIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedAction {
        priority: i64,
        fallback: FallbackSlot,
    }

    impl NamedAction {
        fn new(priority: i64) -> Arc<Self> {
            Arc::new(Self {
                priority,
                fallback: FallbackSlot::default(),
            })
        }
    }

    impl OomAction for NamedAction {
        fn action(&self, _tracker: &MemTracker) {}

        fn set_fallback(&self, fallback: Arc<dyn OomAction>) {
            self.fallback.set(fallback);
        }

        fn fallback(&self) -> Option<Arc<dyn OomAction>> {
            self.fallback.get()
        }

        fn priority(&self) -> i64 {
            self.priority
        }
    }

    fn chain_priorities(mut head: Option<Arc<dyn OomAction>>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(action) = head {
            out.push(action.priority());
            head = action.fallback();
        }
        out
    }

    #[test]
    fn rearrange_orders_by_descending_priority() {
        let mut head: Option<Arc<dyn OomAction>> = None;
        for priority in [PRIORITY_PANIC, PRIORITY_SPILL, PRIORITY_LOG] {
            head = Some(rearrange_fallback(head, NamedAction::new(priority)));
        }
        assert_eq!(
            chain_priorities(head),
            vec![PRIORITY_SPILL, PRIORITY_LOG, PRIORITY_PANIC]
        );
    }

    #[test]
    #[should_panic(expected = "out of memory quota!")]
    fn panic_action_panics_on_first_invocation() {
        let tracker = MemTracker::new_root("query");
        let action = PanicAction::new();
        action.action(&tracker);
    }

    #[test]
    fn log_once_action_acts_once_then_delegates() {
        let tracker = MemTracker::new_root("query");
        let action = LogOnceAction::new();
        let sink = NamedAction::new(PRIORITY_PANIC);
        action.set_fallback(sink.clone());
        action.action(&tracker);
        assert!(action.acted.load(Ordering::Acquire));
        // second invocation forwards pressure down the chain
        action.action(&tracker);
        assert_eq!(action.fallback().map(|f| f.priority()), Some(PRIORITY_PANIC));
    }

    #[test]
    fn rearrange_keeps_existing_head_when_higher() {
        let spill: Arc<dyn OomAction> = NamedAction::new(PRIORITY_SPILL);
        let head = rearrange_fallback(Some(spill), NamedAction::new(PRIORITY_LOG));
        assert_eq!(head.priority(), PRIORITY_SPILL);
        assert_eq!(
            head.fallback().map(|f| f.priority()),
            Some(PRIORITY_LOG)
        );
    }
}
