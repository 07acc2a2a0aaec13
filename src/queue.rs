use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Queue metadata: name plus optional priority and weight.
///
/// Higher priority queues are drained to emptiness before any lower
/// priority queue is touched; an unset priority sorts below every set one.
/// Weight controls relative selection frequency among equal-priority
/// queues (default 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDef {
    pub name: String,
    pub priority: Option<i64>,
    pub weight: Option<u32>,
}

impl QueueDef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            priority: None,
            weight: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1).max(1)
    }

    fn sort_priority(&self) -> i64 {
        self.priority.unwrap_or(i64::MIN)
    }
}

/// Compute the visitation order for one dequeue attempt.
///
/// Each queue expands into `weight` occurrences, the expanded list is
/// shuffled, then stable-sorted descending by priority. The shuffle must
/// come first: the stable sort only reorders elements whose priorities
/// differ, so equal-priority queues keep the random tie-break while strict
/// priority ordering is preserved.
///
/// Callers recompute this on every attempt rather than caching it, so
/// weights keep balancing statistically over time.
pub fn queue_order(defs: &[QueueDef]) -> Vec<String> {
    let mut expanded: Vec<&QueueDef> = Vec::new();
    for def in defs {
        for _ in 0..def.effective_weight() {
            expanded.push(def);
        }
    }

    expanded.shuffle(&mut rand::thread_rng());
    expanded.sort_by(|a, b| b.sort_priority().cmp(&a.sort_priority()));

    expanded.into_iter().map(|def| def.name.clone()).collect()
}
