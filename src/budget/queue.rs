//! Admission requests held while a project's budget is tight.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::oneshot;

/// Sent to a queued requester when its reservation has been made.
#[derive(Debug, Clone, PartialEq)]
pub struct Released {
    pub reserved_usd: f64,
}

#[derive(Debug)]
pub struct QueuedRequest {
    pub run_id: String,
    pub estimate_usd: f64,
    /// 1 is the most urgent.
    pub priority: u8,
    seq: u64,
    pub(super) notify: oneshot::Sender<Released>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // BinaryHeap pops the greatest element: most urgent priority, then the
    // earliest arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    heap: BinaryHeap<QueuedRequest>,
    next_seq: u64,
}

impl AdmissionQueue {
    /// Add a request and return the receiver its owner waits on.
    pub fn push(
        &mut self,
        run_id: &str,
        estimate_usd: f64,
        priority: u8,
    ) -> oneshot::Receiver<Released> {
        let (tx, rx) = oneshot::channel();
        self.next_seq += 1;
        self.heap.push(QueuedRequest {
            run_id: run_id.to_string(),
            estimate_usd,
            priority,
            seq: self.next_seq,
            notify: tx,
        });
        rx
    }

    pub fn peek(&self) -> Option<&QueuedRequest> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }

    /// Drop a request. Returns whether it was queued.
    pub fn remove(&mut self, run_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|r| r.run_id != run_id);
        self.heap.len() != before
    }

    /// 1-based position of `run_id` in release order.
    pub fn position(&self, run_id: &str) -> Option<usize> {
        let mut ordered: Vec<&QueuedRequest> = self.heap.iter().collect();
        ordered.sort_by(|a, b| b.cmp(a));
        ordered.iter().position(|r| r.run_id == run_id).map(|i| i + 1)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Move every request from `other` behind the ones already queued.
    pub fn absorb(&mut self, other: AdmissionQueue) {
        let mut requests = other.heap.into_sorted_vec();
        requests.reverse();
        for mut request in requests {
            self.next_seq += 1;
            request.seq = self.next_seq;
            self.heap.push(request);
        }
    }
}
