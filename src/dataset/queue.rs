//! Thread-safe round-robin FIFO of prompt records (§4.2, §9).
//!
//! "Consume" is really "borrow then return to tail": a user dequeues a
//! record, uses it, and re-enqueues the same record so every user in the
//! swarm cycles through the same shared set. An empty queue is legal and
//! means "no dataset — use the request-body template verbatim".

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::models::PromptRecord;

#[derive(Clone)]
pub struct PromptQueue {
    inner: Arc<Mutex<VecDeque<PromptRecord>>>,
}

impl PromptQueue {
    pub fn new(records: Vec<PromptRecord>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(records.into_iter().collect())),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Dequeues the head record. Returns `None` if the queue is empty —
    /// callers fall back to the request-body template verbatim.
    pub fn borrow(&self) -> Option<PromptRecord> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Re-enqueues a record at the tail, completing one round-robin cycle.
    pub fn ret(&self, record: PromptRecord) {
        self.inner.lock().unwrap().push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str) -> PromptRecord {
        PromptRecord {
            id: id.to_string(),
            prompt_text: id.to_string(),
            image_url: None,
            image_base64: None,
        }
    }

    #[test]
    fn round_robin_visits_every_record_once_per_cycle() {
        let q = PromptQueue::new(vec![rec("a"), rec("b"), rec("c")]);
        let mut order = Vec::new();
        for _ in 0..3 {
            let r = q.borrow().unwrap();
            order.push(r.id.clone());
            q.ret(r);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        // Second cycle repeats the same order.
        let mut order2 = Vec::new();
        for _ in 0..3 {
            let r = q.borrow().unwrap();
            order2.push(r.id.clone());
            q.ret(r);
        }
        assert_eq!(order2, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_queue_returns_none() {
        let q = PromptQueue::empty();
        assert!(q.borrow().is_none());
    }
}
