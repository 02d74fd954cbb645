//! Invocation statistics.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub per_definition: BTreeMap<String, u64>,
}

/// Counts served mock invocations.
///
/// Recording never fails and never blocks on anything but a short lock.
#[derive(Debug, Default)]
pub struct InvocationCounter {
    total: AtomicU64,
    per_definition: Mutex<HashMap<String, u64>>,
}

impl InvocationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, definition_id: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self
            .per_definition
            .lock()
            .entry(definition_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            per_definition: self
                .per_definition
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}
