//! Request-state pool.
//!
//! Every in-flight request owns one pooled [`RequestState`]: the decoded
//! descriptor, the bounce buffer, the computed guest copy plan, and the
//! completion bookkeeping. States are recycled through a free list so the
//! steady-state drain loop performs no allocation; buffers keep their
//! capacity across reuse.

use crate::mem::CopySegment;
use crate::validate::Operation;
use pvblock_proto::{Descriptor, RSP_OKAY};
use std::collections::VecDeque;

/// Index of a pooled request state. Valid until released back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHandle(usize);

impl RequestHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Mutable per-request state, owned by the pool.
#[derive(Debug)]
pub struct RequestState {
    /// Decoded descriptor as it arrived on the ring.
    pub desc: Descriptor,
    /// Operation class actually serviced; barrier variants collapse to flush.
    pub class: Operation,
    /// Response status accumulated across phases.
    pub status: i16,
    /// True while a flush must complete before the data phase starts.
    pub presync: bool,
    /// Outstanding backend operations for this request.
    pub inflight: u32,
    /// Backend operations that failed.
    pub errors: u32,
    /// First byte of the backing store touched by this request.
    pub start: u64,
    /// Total byte length of the data phase.
    pub size: usize,
    /// Bounce buffer staging data between guest pages and the backend.
    pub buf: Vec<u8>,
    /// Guest copy plan, one entry per validated segment.
    pub copy: Vec<CopySegment>,
}

impl RequestState {
    fn new() -> Self {
        Self {
            desc: Descriptor::default(),
            class: Operation::Read,
            status: RSP_OKAY,
            presync: false,
            inflight: 0,
            errors: 0,
            start: 0,
            size: 0,
            buf: Vec::new(),
            copy: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.desc = Descriptor::default();
        self.class = Operation::Read;
        self.status = RSP_OKAY;
        self.presync = false;
        self.inflight = 0;
        self.errors = 0;
        self.start = 0;
        self.size = 0;
        self.buf.clear();
        self.copy.clear();
    }
}

/// Bounded arena of [`RequestState`] objects.
pub struct RequestPool {
    slots: Vec<RequestState>,
    free: Vec<RequestHandle>,
    finished: VecDeque<RequestHandle>,
    max: usize,
}

impl RequestPool {
    /// `max` bounds the number of simultaneously acquired states; it is
    /// normally the ring size.
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            finished: VecDeque::new(),
            max,
        }
    }

    /// Take a fresh state, recycling a released one when available.
    /// Returns `None` once `max` states are in flight.
    pub fn acquire(&mut self) -> Option<RequestHandle> {
        if let Some(handle) = self.free.pop() {
            return Some(handle);
        }
        if self.slots.len() >= self.max {
            return None;
        }
        self.slots.push(RequestState::new());
        Some(RequestHandle(self.slots.len() - 1))
    }

    /// Queue a completed request for response emission, preserving
    /// completion order.
    pub fn finish(&mut self, handle: RequestHandle) {
        self.finished.push_back(handle);
    }

    /// Dequeue the oldest completed request, if any.
    pub fn pop_finished(&mut self) -> Option<RequestHandle> {
        self.finished.pop_front()
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Reset a state and return it to the free list.
    pub fn release(&mut self, handle: RequestHandle) {
        self.slots[handle.0].reset();
        self.free.push(handle);
    }

    pub fn get(&self, handle: RequestHandle) -> &RequestState {
        &self.slots[handle.0]
    }

    pub fn get_mut(&mut self, handle: RequestHandle) -> &mut RequestState {
        &mut self.slots[handle.0]
    }

    /// States currently acquired.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
