//! Limits enforced on the host side of an evaluation.
//!
//! The interpreter's memory limit and interrupt handler only cover QuickJS.
//! Generators and expansion run in Rust, so they check the same deadline and
//! charge their output here.

use crate::error::{MockError, MockResult};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Longest string or list a single generator call produces.
pub const MAX_GENERATED_LEN: usize = 100_000;

/// Clamp a requested length to `[0, MAX_GENERATED_LEN]`.
pub fn clamp_len(len: i64) -> usize {
    usize::try_from(len.max(0)).map_or(MAX_GENERATED_LEN, |n| n.min(MAX_GENERATED_LEN))
}

/// Wall-clock deadline shared by the interrupt handler, the expander and the
/// generators. Once any of them observes expiry the flag stays set.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    fired: Arc<AtomicBool>,
}

impl Deadline {
    pub fn new(at: Instant) -> Self {
        Self {
            at,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn expired(&self) -> bool {
        if self.fired.load(Ordering::Relaxed) {
            return true;
        }
        if Instant::now() >= self.at {
            self.fired.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Whether expiry has been observed, without reading the clock.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }
}

/// Byte budget for the generated document.
#[derive(Debug)]
pub struct OutputBudget {
    limit: usize,
    used: usize,
}

impl OutputBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    /// Account for `bytes` more output, failing once the limit is passed.
    pub fn charge(&mut self, bytes: usize) -> MockResult<()> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(MockError::SandboxRuntime(format!(
                "generated output exceeds {} bytes",
                self.limit
            )));
        }
        Ok(())
    }
}

/// Approximate in-memory size of a generated value.
pub fn weight(value: &Value) -> usize {
    const NODE: usize = 8;
    match value {
        Value::String(s) => NODE + s.len(),
        Value::Array(items) => NODE + items.iter().map(weight).sum::<usize>(),
        Value::Object(map) => {
            NODE + map.iter().map(|(k, v)| k.len() + weight(v)).sum::<usize>()
        }
        _ => NODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_clamp_len() {
        assert_eq!(clamp_len(-1), 0);
        assert_eq!(clamp_len(5), 5);
        assert_eq!(clamp_len(i64::MAX), MAX_GENERATED_LEN);
    }

    #[test]
    fn test_deadline_latches() {
        let deadline = Deadline::new(Instant::now() + Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(!deadline.fired());

        let past = Deadline::new(Instant::now());
        assert!(past.expired());
        assert!(past.fired());
        assert!(past.clone().fired());
    }

    #[test]
    fn test_output_budget() {
        let mut budget = OutputBudget::new(100);
        assert!(budget.charge(60).is_ok());
        assert!(budget.charge(40).is_ok());
        assert!(matches!(budget.charge(1), Err(MockError::SandboxRuntime(_))));
    }

    #[test]
    fn test_weight() {
        assert_eq!(weight(&json!("abc")), 11);
        assert_eq!(weight(&json!([1, 2])), 24);
        assert_eq!(weight(&json!({"k": "v"})), 8 + 1 + 9);
    }
}
