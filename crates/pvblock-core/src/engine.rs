//! The dataplane engine.
//!
//! One engine task owns the ring transport and the request pool outright.
//! Backend calls run as spawned tasks and report back through an unbounded
//! completion queue, so every cursor move, pool mutation, and response push
//! happens on the engine task. The drain loop mirrors the ring protocol:
//! emit finished responses, pull and validate new requests, submit their
//! backend operations, then decide whether to re-arm itself or go idle until
//! a doorbell or a completion wakes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pvblock_proto::{Response, RSP_ERROR, RSP_NOT_SUPPORTED, RSP_OKAY};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::backend::BlockBackend;
use crate::chan::EventChannel;
use crate::dispatch::{discard_chunks, Completion, Phase};
use crate::mem::GrantTable;
use crate::metrics;
use crate::pool::{RequestHandle, RequestPool};
use crate::ring::RingTransport;
use crate::validate::{validate, DeviceLimits, Operation, ValidationError};

struct Shared {
    kick: Notify,
    stop: AtomicBool,
}

/// Control handle for a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Doorbell: the frontend published new requests.
    pub fn kick(&self) {
        self.shared.kick.notify_one();
    }

    /// Stop the engine. It stops pulling requests, waits for every
    /// outstanding backend operation, then drops the ring mapping.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.kick.notify_one();
    }
}

/// Dataplane for one virtual block device.
pub struct Engine {
    ring: RingTransport,
    pool: RequestPool,
    grants: Arc<dyn GrantTable>,
    backend: Arc<dyn BlockBackend>,
    channel: Arc<dyn EventChannel>,
    limits: DeviceLimits,
    shared: Arc<Shared>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    /// Requests accepted and not yet moved to the finished queue.
    inflight: usize,
    warned_unknown_op: bool,
}

impl Engine {
    pub fn new(
        ring: RingTransport,
        grants: Arc<dyn GrantTable>,
        backend: Arc<dyn BlockBackend>,
        channel: Arc<dyn EventChannel>,
        block_size: u32,
    ) -> (Self, EngineHandle) {
        let limits = DeviceLimits {
            block_size,
            capacity: backend.len(),
            read_only: backend.is_read_only(),
        };
        let max_requests = ring.size() as usize;
        let shared = Arc::new(Shared {
            kick: Notify::new(),
            stop: AtomicBool::new(false),
        });
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            shared: shared.clone(),
        };
        (
            Self {
                ring,
                pool: RequestPool::new(max_requests),
                grants,
                backend,
                channel,
                limits,
                shared,
                completions_tx,
                completions_rx,
                inflight: 0,
                warned_unknown_op: false,
            },
            handle,
        )
    }

    /// Run until [`EngineHandle::stop`], then drain outstanding backend
    /// operations and drop the ring mapping.
    pub async fn run(mut self) {
        let shared = self.shared.clone();
        loop {
            self.drain();
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = shared.kick.notified() => {}
                Some(completion) = self.completions_rx.recv() => {
                    self.on_completion(completion);
                    while let Ok(more) = self.completions_rx.try_recv() {
                        self.on_completion(more);
                    }
                }
            }
        }
        self.settle().await;
    }

    /// One drain cycle: responses out, requests in, at most one notify.
    fn drain(&mut self) {
        // Once stopped, nothing is emitted to the guest any more; a
        // completion that raced the stop signal is absorbed by settle.
        if self.shared.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut more_work = false;
        let mut notify = self.emit_responses(&mut more_work);

        while !self.shared.stop.load(Ordering::SeqCst) {
            if self.ring.cons_overflow() {
                error!("ring cursors corrupt, abandoning drain");
                break;
            }
            if !self.ring.has_unconsumed_requests() {
                break;
            }
            let Some(handle) = self.pool.acquire() else {
                // Backpressure. Leave the requests on the ring and retry
                // once completions free pool slots.
                more_work = true;
                break;
            };
            let Some(desc) = self.ring.next_request() else {
                self.pool.release(handle);
                break;
            };
            match validate(&desc, &self.limits) {
                Ok(op) => {
                    trace!(id = desc.id, op = ?op.operation, start = op.start, size = op.size,
                        "request accepted");
                    self.inflight += 1;
                    metrics::record_inflight_requests(self.inflight);
                    let state = self.pool.get_mut(handle);
                    state.desc = desc;
                    state.class = op.operation;
                    state.presync = op.presync;
                    state.start = op.start;
                    state.size = op.size;
                    state.copy = op.segments;
                    self.submit(handle);
                }
                Err(err) => {
                    if let ValidationError::UnsupportedOp(code) = err {
                        if !self.warned_unknown_op {
                            self.warned_unknown_op = true;
                            warn!(operation = code, "unknown operation code");
                        }
                    } else {
                        debug!(id = desc.id, %err, "invalid request");
                    }
                    metrics::observe_request_invalid();
                    let status = match err {
                        ValidationError::UnsupportedOp(_) => RSP_NOT_SUPPORTED,
                        _ => RSP_ERROR,
                    };
                    let response = Response {
                        id: desc.id,
                        operation: desc.operation,
                        status,
                    };
                    // Refused requests answer immediately, outside the
                    // finished queue.
                    if self.push_response(&response, &mut more_work) {
                        self.channel.notify();
                        metrics::observe_notify();
                    }
                    self.pool.release(handle);
                }
            }
        }

        if self.pool.finished_len() > 0 {
            notify |= self.emit_responses(&mut more_work);
        }
        if notify {
            self.channel.notify();
            metrics::observe_notify();
        }
        if more_work && self.inflight < self.pool.max() {
            self.shared.kick.notify_one();
        }
    }

    /// Push every finished response in completion order. Returns whether the
    /// frontend asked to be notified for any of them.
    fn emit_responses(&mut self, more_work: &mut bool) -> bool {
        let mut notify = false;
        while let Some(handle) = self.pool.pop_finished() {
            let response = {
                let state = self.pool.get(handle);
                Response {
                    id: state.desc.id,
                    operation: state.desc.operation,
                    status: state.status,
                }
            };
            notify |= self.push_response(&response, more_work);
            self.pool.release(handle);
        }
        notify
    }

    /// Push one response and run the tail check: once responses catch up
    /// with consumption, re-arm the request event and look again; otherwise
    /// any unconsumed requests already mean more work.
    fn push_response(&mut self, response: &Response, more_work: &mut bool) -> bool {
        let notify = self.ring.push_response(response);
        if self.ring.responses_caught_up() {
            if self.ring.final_check_for_requests() {
                *more_work = true;
            }
        } else if self.ring.has_unconsumed_requests() {
            *more_work = true;
        }
        notify
    }

    /// Start the backend work for a freshly validated request.
    fn submit(&mut self, handle: RequestHandle) {
        let needs_copy_in = {
            let state = self.pool.get(handle);
            state.size > 0 && matches!(state.class, Operation::Write | Operation::Flush)
        };
        if needs_copy_in {
            // Single copy-in, ahead of any presync; the data phase reuses
            // the same buffer.
            let state = self.pool.get_mut(handle);
            state.buf.resize(state.size, 0);
            if let Err(err) = self.grants.copy_from_guest(&state.copy, &mut state.buf) {
                warn!(%err, "guest copy-in failed");
                self.complete_request(handle, RSP_ERROR);
                return;
            }
        }

        if self.pool.get(handle).presync {
            self.pool.get_mut(handle).inflight = 1;
            let backend = self.backend.clone();
            let tx = self.completions_tx.clone();
            tokio::spawn(async move {
                let result = backend.flush().await;
                let _ = tx.send(Completion {
                    handle,
                    phase: Phase::Presync,
                    result,
                    buf: None,
                });
            });
            return;
        }
        self.start_data_phase(handle);
    }

    fn start_data_phase(&mut self, handle: RequestHandle) {
        let (class, start, size) = {
            let state = self.pool.get(handle);
            (state.class, state.start, state.size)
        };
        let backend = self.backend.clone();
        let tx = self.completions_tx.clone();
        match class {
            Operation::Read => {
                if size == 0 {
                    self.complete_request(handle, RSP_OKAY);
                    return;
                }
                let state = self.pool.get_mut(handle);
                state.inflight = 1;
                let mut buf = std::mem::take(&mut state.buf);
                buf.resize(size, 0);
                tokio::spawn(async move {
                    let result = backend.read_at(start, &mut buf).await;
                    let _ = tx.send(Completion {
                        handle,
                        phase: Phase::Data,
                        result,
                        buf: Some(buf),
                    });
                });
            }
            Operation::Write | Operation::Flush => {
                if size == 0 {
                    // Pure flush already ran as the presync phase;
                    // zero-length writes touch nothing.
                    self.complete_request(handle, RSP_OKAY);
                    return;
                }
                let state = self.pool.get_mut(handle);
                state.inflight = 1;
                let buf = std::mem::take(&mut state.buf);
                tokio::spawn(async move {
                    let result = backend.write_at(start, &buf).await;
                    let _ = tx.send(Completion {
                        handle,
                        phase: Phase::Data,
                        result,
                        buf: Some(buf),
                    });
                });
            }
            Operation::Discard => {
                let chunks = discard_chunks(start, size as u64, self.limits.block_size);
                if chunks.is_empty() {
                    self.complete_request(handle, RSP_OKAY);
                    return;
                }
                self.pool.get_mut(handle).inflight = chunks.len() as u32;
                for chunk in chunks {
                    let backend = backend.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = backend.discard(chunk.offset, chunk.len).await;
                        let _ = tx.send(Completion {
                            handle,
                            phase: Phase::Data,
                            result,
                            buf: None,
                        });
                    });
                }
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let handle = completion.handle;
        {
            let state = self.pool.get_mut(handle);
            if let Some(buf) = completion.buf {
                state.buf = buf;
            }
            if let Err(err) = &completion.result {
                warn!(id = state.desc.id, phase = ?completion.phase, %err,
                    "backend operation failed");
                state.errors += 1;
            }
            state.inflight -= 1;
        }
        let (presync, still_inflight, class, errors) = {
            let state = self.pool.get(handle);
            (state.presync, state.inflight, state.class, state.errors)
        };
        if presync {
            // The data phase starts only now; a failed flush still runs it
            // and the error surfaces in the aggregate status.
            self.pool.get_mut(handle).presync = false;
            self.start_data_phase(handle);
            return;
        }
        if still_inflight > 0 {
            return;
        }
        if class == Operation::Read && errors == 0 {
            let state = self.pool.get_mut(handle);
            if let Err(err) = self.grants.copy_to_guest(&state.copy, &state.buf) {
                warn!(%err, "guest copy-out failed");
                state.errors += 1;
            }
        }
        let status = if self.pool.get(handle).errors > 0 {
            RSP_ERROR
        } else {
            RSP_OKAY
        };
        self.complete_request(handle, status);
    }

    /// Record the outcome and queue the request for response emission.
    fn complete_request(&mut self, handle: RequestHandle, status: i16) {
        let (class, size) = {
            let state = self.pool.get(handle);
            (state.class, state.size)
        };
        if status == RSP_OKAY {
            metrics::observe_request_done(class, size);
        } else {
            metrics::observe_request_failed(class);
        }
        self.pool.get_mut(handle).status = status;
        self.inflight -= 1;
        metrics::record_inflight_requests(self.inflight);
        self.pool.finish(handle);
    }

    /// Teardown: absorb every outstanding completion without emitting
    /// anything further to the guest, so the ring mapping outlives the last
    /// backend operation that could touch a bounce buffer.
    async fn settle(&mut self) {
        if self.inflight > 0 {
            debug!(inflight = self.inflight, "waiting for outstanding backend operations");
        }
        while self.inflight > 0 {
            let Some(completion) = self.completions_rx.recv().await else {
                break;
            };
            let state = self.pool.get_mut(completion.handle);
            if let Some(buf) = completion.buf {
                state.buf = buf;
            }
            state.presync = false;
            state.inflight -= 1;
            if state.inflight == 0 {
                self.inflight -= 1;
                self.pool.release(completion.handle);
            }
        }
    }
}
