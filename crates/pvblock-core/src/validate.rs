//! Descriptor validation.
//!
//! Turns a raw ring descriptor into a typed, bounds-checked operation before
//! any backing-store call is issued. Guest-controlled fields (sectors, grant
//! offsets, segment counts) are all range-checked here; a failure becomes an
//! error response without touching storage.

use crate::mem::CopySegment;
use pvblock_proto::{
    Descriptor, MAX_SEGMENTS_PER_REQUEST, OP_DISCARD, OP_FLUSH_DISKCACHE, OP_READ, OP_WRITE,
    OP_WRITE_BARRIER, PAGE_SIZE,
};
use std::fmt;

/// Operation class after opcode mapping. Both barrier opcodes service as
/// [`Operation::Flush`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Flush,
    Discard,
}

/// Why a descriptor was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationError {
    UnsupportedOp(u8),
    ReadOnly,
    TooManySegments(u8),
    BadSegment { index: usize },
    OutOfRange,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::UnsupportedOp(op) => write!(f, "unsupported operation {op}"),
            ValidationError::ReadOnly => f.write_str("write to read-only device"),
            ValidationError::TooManySegments(n) => write!(f, "too many segments ({n})"),
            ValidationError::BadSegment { index } => write!(f, "bad segment {index}"),
            ValidationError::OutOfRange => f.write_str("access beyond end of device"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Device geometry the validator checks against.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    /// Logical block size in bytes; sector fields are in these units.
    pub block_size: u32,
    /// Backing store size in bytes.
    pub capacity: u64,
    pub read_only: bool,
}

/// A descriptor that passed every check.
///
/// `segments` is the guest copy plan for the data phase; for a flush with
/// segments the data phase is a write gated on the presync flush. Discards
/// carry no segments; `size` is the byte count to discard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub operation: Operation,
    /// A flush must complete before the data phase is submitted.
    pub presync: bool,
    /// First byte of the backing store touched.
    pub start: u64,
    /// Total data-phase length in bytes. Zero means no storage call.
    pub size: usize,
    pub segments: Vec<CopySegment>,
}

/// Apply the validation rules in order. Never issues I/O.
pub fn validate(desc: &Descriptor, limits: &DeviceLimits) -> Result<ValidatedRequest, ValidationError> {
    let block_size = limits.block_size as u64;
    let (operation, presync, has_data) = match desc.operation {
        OP_READ => (Operation::Read, false, true),
        OP_WRITE => (Operation::Write, false, true),
        OP_WRITE_BARRIER | OP_FLUSH_DISKCACHE => {
            (Operation::Flush, true, desc.nr_segments != 0)
        }
        OP_DISCARD => (Operation::Discard, false, false),
        other => return Err(ValidationError::UnsupportedOp(other)),
    };

    if limits.read_only && has_data && operation != Operation::Read {
        return Err(ValidationError::ReadOnly);
    }

    if operation == Operation::Discard {
        // No data segments; the overlay count still gets a full range check,
        // with any overflow refused rather than wrapped.
        let start = desc
            .sector_number
            .checked_mul(block_size)
            .ok_or(ValidationError::OutOfRange)?;
        let len = desc
            .nr_sectors
            .checked_mul(block_size)
            .ok_or(ValidationError::OutOfRange)?;
        let end = start.checked_add(len).ok_or(ValidationError::OutOfRange)?;
        if end > limits.capacity {
            return Err(ValidationError::OutOfRange);
        }
        return Ok(ValidatedRequest {
            operation,
            presync,
            start,
            size: len as usize,
            segments: Vec::new(),
        });
    }

    if !has_data {
        // Pure flush.
        return Ok(ValidatedRequest {
            operation,
            presync,
            start: 0,
            size: 0,
            segments: Vec::new(),
        });
    }

    if desc.nr_segments as usize > MAX_SEGMENTS_PER_REQUEST {
        return Err(ValidationError::TooManySegments(desc.nr_segments));
    }

    let mut segments = Vec::with_capacity(desc.nr_segments as usize);
    let mut size = 0u64;
    for (index, seg) in desc.segments[..desc.nr_segments as usize].iter().enumerate() {
        if seg.first_sect > seg.last_sect {
            return Err(ValidationError::BadSegment { index });
        }
        if (seg.last_sect as u64 + 1) * block_size > PAGE_SIZE as u64 {
            return Err(ValidationError::BadSegment { index });
        }
        let len = (seg.last_sect as u64 - seg.first_sect as u64 + 1) * block_size;
        segments.push(CopySegment {
            gref: seg.gref,
            offset: seg.first_sect as u32 * limits.block_size,
            len: len as u32,
        });
        size += len;
    }

    let start = desc
        .sector_number
        .checked_mul(block_size)
        .ok_or(ValidationError::OutOfRange)?;
    let end = start.checked_add(size).ok_or(ValidationError::OutOfRange)?;
    if end > limits.capacity {
        return Err(ValidationError::OutOfRange);
    }

    Ok(ValidatedRequest {
        operation,
        presync,
        start,
        size: size as usize,
        segments,
    })
}
