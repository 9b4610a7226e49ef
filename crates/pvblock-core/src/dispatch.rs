//! Sub-operation planning.
//!
//! A validated request becomes one or more backend calls: an optional presync
//! flush, then a data phase of one transfer or several discard chunks. The
//! types here carry the plan and the completion record that flows back to the
//! engine through its completion queue.

use crate::backend::BackendResult;
use crate::pool::RequestHandle;

/// Largest single discard, in sectors. Larger requests are split into
/// independent chunks so no single backend call exceeds the transfer cap.
pub const DISCARD_MAX_SECTORS: u64 = (i32::MAX as u64) >> 9;

/// Which phase of the request a completion belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// The flush that must finish before the data phase starts.
    Presync,
    /// A data-phase transfer or discard chunk, or a pure flush.
    Data,
}

/// One backend call coming back to the engine.
pub struct Completion {
    pub handle: RequestHandle,
    pub phase: Phase,
    pub result: BackendResult<()>,
    /// Bounce buffer travelling with read/write calls; handed back so the
    /// pool can recycle its capacity (and, for reads, copy data out).
    pub buf: Option<Vec<u8>>,
}

/// Byte range of one discard chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscardChunk {
    pub offset: u64,
    pub len: u64,
}

/// Split a discard into chunks of at most [`DISCARD_MAX_SECTORS`] sectors.
/// A zero-length discard yields no chunks.
pub fn discard_chunks(start: u64, len: u64, block_size: u32) -> Vec<DiscardChunk> {
    let limit = DISCARD_MAX_SECTORS * block_size as u64;
    let mut chunks = Vec::new();
    let mut offset = start;
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(limit);
        chunks.push(DiscardChunk { offset, len: chunk });
        offset += chunk;
        remaining -= chunk;
    }
    chunks
}
