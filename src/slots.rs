//! In-memory execution concurrency tracking.
//!
//! Two counters — a global cap and a per-agent cap — guarded by one mutex so
//! the reserve decision is atomic. Release happens through an RAII guard,
//! the same pattern this codebase uses for its on-disk process lock: the
//! guard's `Drop` runs on every exit path, including a panic unwind, so a
//! slot can never leak. The table is always shared behind an `Arc` so a
//! guard can be moved into a spawned worker task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Counters {
    global_in_flight: usize,
    per_agent_in_flight: HashMap<String, usize>,
}

pub struct ExecutionSlotTable {
    max_concurrent: usize,
    inner: Mutex<Counters>,
}

impl ExecutionSlotTable {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            inner: Mutex::new(Counters {
                global_in_flight: 0,
                per_agent_in_flight: HashMap::new(),
            }),
        }
    }

    /// Attempt to reserve a slot for `abbr` with its own `max_parallel`
    /// cap. Returns a guard on success; the caller holds it for the
    /// lifetime of the execution and the slot releases when it drops. The
    /// guard owns an `Arc` clone of the table so it can be moved into a
    /// spawned `tokio` task.
    pub fn reserve(self: &Arc<Self>, abbr: &str, max_parallel: usize) -> Option<SlotGuard> {
        let mut counters = self.inner.lock().unwrap();

        if counters.global_in_flight >= self.max_concurrent {
            return None;
        }
        let per_agent = counters.per_agent_in_flight.entry(abbr.to_string()).or_insert(0);
        if *per_agent >= max_parallel {
            return None;
        }

        counters.global_in_flight += 1;
        *per_agent += 1;

        Some(SlotGuard {
            table: Arc::clone(self),
            abbr: abbr.to_string(),
        })
    }

    pub fn global_in_flight(&self) -> usize {
        self.inner.lock().unwrap().global_in_flight
    }

    pub fn agent_in_flight(&self, abbr: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .per_agent_in_flight
            .get(abbr)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, abbr: &str) {
        let mut counters = self.inner.lock().unwrap();
        counters.global_in_flight = counters.global_in_flight.saturating_sub(1);
        if let Some(count) = counters.per_agent_in_flight.get_mut(abbr) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Held for the duration of one agent execution. Dropping it — on success,
/// failure, timeout, or panic unwind — releases the slot unconditionally.
pub struct SlotGuard {
    table: Arc<ExecutionSlotTable>,
    abbr: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.release(&self.abbr);
    }
}
