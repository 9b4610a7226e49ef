//! Shared-ring transport.
//!
//! [`RingTransport`] owns the backend's private cursors over a mapped ring
//! and implements the producer/consumer handshake: request consumption,
//! response production, and the event-index notification suppression that
//! keeps doorbell traffic to a minimum. All shared-memory traffic goes
//! through the [`RingMemory`] abstraction so the same transport drives real
//! grant mappings and heap-backed test rings alike.

use anyhow::{ensure, Result};
use pvblock_proto::{
    Descriptor, Protocol, Response, SlotCodec, PAGE_SIZE, REQ_EVENT_OFFSET, REQ_PROD_OFFSET,
    RING_HEADER_LEN, RSP_EVENT_OFFSET, RSP_PROD_OFFSET,
};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Byte-addressable window over the shared ring pages.
///
/// Loads and stores of the four header indices must be individually atomic
/// with respect to the frontend; implementations over real shared memory use
/// volatile or atomic accesses for `load_u32` / `store_u32`.
pub trait RingMemory: Send {
    /// Total window length in bytes.
    fn len(&self) -> usize;

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    fn read(&self, offset: usize, out: &mut [u8]);

    /// Copy `data` into the window starting at `offset`.
    fn write(&self, offset: usize, data: &[u8]);

    /// Load a little-endian u32 header field.
    fn load_u32(&self, offset: usize) -> u32;

    /// Store a little-endian u32 header field.
    fn store_u32(&self, offset: usize, value: u32);
}

/// Heap-backed [`RingMemory`] shared between a test frontend and the
/// transport. Clones alias the same buffer.
#[derive(Clone, Default)]
pub struct HeapRing {
    bytes: Arc<Mutex<Box<[u8]>>>,
}

impl HeapRing {
    pub fn new(page_count: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(
                vec![0u8; page_count * PAGE_SIZE].into_boxed_slice(),
            )),
        }
    }
}

impl RingMemory for HeapRing {
    fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn load_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read(offset, &mut word);
        u32::from_le_bytes(word)
    }

    fn store_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }
}

/// Backend half of one shared ring.
///
/// Holds the private consumer cursor (`req_cons`) and private response
/// producer (`rsp_prod_pvt`); the shared header carries the public indices.
/// Index arithmetic is wrapping u32 throughout, matching the frontend.
pub struct RingTransport {
    mem: Box<dyn RingMemory>,
    codec: &'static dyn SlotCodec,
    size: u32,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl RingTransport {
    /// Wrap a mapped ring window. `page_count` determines the slot count for
    /// the negotiated protocol; the window must cover all pages.
    pub fn new(protocol: Protocol, mem: Box<dyn RingMemory>, page_count: usize) -> Result<Self> {
        ensure!(
            mem.len() >= page_count * PAGE_SIZE,
            "ring window of {} bytes shorter than {page_count} pages",
            mem.len()
        );
        let size = protocol.ring_slots(page_count);
        ensure!(size > 0, "ring too small for any {protocol} slot");
        Ok(Self {
            mem,
            codec: protocol.codec(),
            size,
            req_cons: 0,
            rsp_prod_pvt: 0,
        })
    }

    /// Number of slots in the ring.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn req_cons(&self) -> u32 {
        self.req_cons
    }

    pub fn rsp_prod_pvt(&self) -> u32 {
        self.rsp_prod_pvt
    }

    fn req_prod(&self) -> u32 {
        self.mem.load_u32(REQ_PROD_OFFSET)
    }

    fn slot_offset(&self, index: u32) -> usize {
        RING_HEADER_LEN + (index & (self.size - 1)) as usize * self.codec.slot_len()
    }

    /// A well-behaved frontend never lets the consumer run a full ring ahead
    /// of the responses it has been given. Seeing that means the shared
    /// indices are corrupt and the ring must be abandoned.
    pub fn cons_overflow(&self) -> bool {
        self.req_cons.wrapping_sub(self.rsp_prod_pvt) >= self.size
    }

    /// Number of requests published but not yet consumed, clamped to the
    /// slots actually available to us. A frontend racing its producer index
    /// past that clamp cannot trick us into reading unowned slots.
    pub fn unconsumed_requests(&self) -> u32 {
        let published = self.req_prod().wrapping_sub(self.req_cons);
        let usable = self.size - self.req_cons.wrapping_sub(self.rsp_prod_pvt);
        published.min(usable)
    }

    pub fn has_unconsumed_requests(&self) -> bool {
        self.unconsumed_requests() > 0
    }

    /// Consume the next request, advancing the private cursor.
    pub fn next_request(&mut self) -> Option<Descriptor> {
        if self.unconsumed_requests() == 0 {
            return None;
        }
        let mut slot = [0u8; pvblock_proto::MAX_SLOT_LEN];
        let slot = &mut slot[..self.codec.slot_len()];
        self.mem.read(self.slot_offset(self.req_cons), slot);
        match self.codec.decode_request(slot) {
            Ok(desc) => {
                self.req_cons = self.req_cons.wrapping_add(1);
                Some(desc)
            }
            Err(err) => {
                // Unreachable with a full slot read; guard it anyway.
                error!(%err, "ring slot decode failed");
                None
            }
        }
    }

    /// Write a response into the slot of its request and publish it.
    ///
    /// Returns true when the frontend asked to be notified for this
    /// response, per the event-index protocol: notify only if the response
    /// crossed `rsp_event`.
    pub fn push_response(&mut self, response: &Response) -> bool {
        let mut slot = [0u8; pvblock_proto::MAX_SLOT_LEN];
        let slot = &mut slot[..self.codec.slot_len()];
        if let Err(err) = self.codec.encode_response(response, slot) {
            error!(%err, "ring slot encode failed");
            return false;
        }
        self.mem.write(self.slot_offset(self.rsp_prod_pvt), slot);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);

        let old = self.mem.load_u32(RSP_PROD_OFFSET);
        let new = self.rsp_prod_pvt;
        self.mem.store_u32(RSP_PROD_OFFSET, new);
        let rsp_event = self.mem.load_u32(RSP_EVENT_OFFSET);
        new.wrapping_sub(rsp_event) < new.wrapping_sub(old)
    }

    /// Arm the request event index and re-check for work published in the
    /// race window. Returns true when more requests are already waiting.
    pub fn final_check_for_requests(&mut self) -> bool {
        if self.has_unconsumed_requests() {
            return true;
        }
        self.mem
            .store_u32(REQ_EVENT_OFFSET, self.req_cons.wrapping_add(1));
        self.has_unconsumed_requests()
    }

    /// True once every consumed request has had its response pushed.
    pub fn responses_caught_up(&self) -> bool {
        self.rsp_prod_pvt == self.req_cons
    }
}
