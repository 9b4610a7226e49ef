#![no_std]

//! Wire format for the paravirtual block ring.
//!
//! A ring is one or more shared 4 KiB pages holding a small control header
//! followed by a power-of-two array of slots. Each slot carries a request
//! descriptor until the backend consumes it, and the response for the same
//! logical index afterwards. Three slot encodings exist: the native layout
//! and two fixed-width compatibility layouts that differ only in alignment.

use core::fmt;

/// Size of one shared ring page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Byte offset of the first slot; the control header occupies this prefix.
pub const RING_HEADER_LEN: usize = 64;
/// Largest slot encoding across all protocol variants.
pub const MAX_SLOT_LEN: usize = 112;
/// Maximum number of scatter-gather segments a single request may carry.
pub const MAX_SEGMENTS_PER_REQUEST: usize = 11;

/// Control header offsets, shared by every protocol variant.
pub const REQ_PROD_OFFSET: usize = 0;
pub const REQ_EVENT_OFFSET: usize = 4;
pub const RSP_PROD_OFFSET: usize = 8;
pub const RSP_EVENT_OFFSET: usize = 12;

/// Request operation codes.
pub const OP_READ: u8 = 0;
pub const OP_WRITE: u8 = 1;
/// Legacy write barrier; serviced as a flush.
pub const OP_WRITE_BARRIER: u8 = 2;
pub const OP_FLUSH_DISKCACHE: u8 = 3;
pub const OP_DISCARD: u8 = 5;

/// Response status codes.
pub const RSP_OKAY: i16 = 0;
pub const RSP_ERROR: i16 = -1;
pub const RSP_NOT_SUPPORTED: i16 = -2;

/// Errors surfaced while encoding or decoding ring slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the slot length of the variant.
    InvalidLength { expected: usize, actual: usize },
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid slot length {actual}, expected {expected}")
            }
        }
    }
}

/// Result alias for slot codec operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// One scatter-gather segment: a sub-range of a single granted page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentDesc {
    /// Grant/memory reference naming the guest page.
    pub gref: u32,
    /// First sector of the page covered by this segment.
    pub first_sect: u8,
    /// Last sector of the page covered by this segment (inclusive).
    pub last_sect: u8,
}

/// A request descriptor decoded into its variant-independent form.
///
/// For discard requests the segment area of the slot instead holds a 64-bit
/// sector count; both views are decoded and `nr_segments` doubles as the
/// discard flag byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: u16,
    /// Opaque correlation id, echoed verbatim in the response.
    pub id: u64,
    pub sector_number: u64,
    pub segments: [SegmentDesc; MAX_SEGMENTS_PER_REQUEST],
    /// Discard overlay: number of sectors to discard.
    pub nr_sectors: u64,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            operation: 0,
            nr_segments: 0,
            handle: 0,
            id: 0,
            sector_number: 0,
            segments: [SegmentDesc::default(); MAX_SEGMENTS_PER_REQUEST],
            nr_sectors: 0,
        }
    }
}

/// A response occupying the slot of its originating request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    /// Copied from the request.
    pub id: u64,
    /// Copied from the request.
    pub operation: u8,
    pub status: i16,
}

/// Slot encoding variant negotiated at ring setup.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Native pointer-width layout (identical to the 64-bit layout).
    Native,
    /// 32-bit guest compatibility layout, 4-byte packed.
    X86_32,
    /// 64-bit guest compatibility layout.
    X86_64,
}

impl Protocol {
    /// Returns the slot codec for this variant. Selected once at ring setup;
    /// never consulted per-field afterwards.
    pub fn codec(self) -> &'static dyn SlotCodec {
        match self {
            Protocol::Native => &NATIVE_CODEC,
            Protocol::X86_32 => &X86_32_CODEC,
            Protocol::X86_64 => &X86_64_CODEC,
        }
    }

    /// Slot length in bytes for this variant.
    pub fn slot_len(self) -> usize {
        self.codec().slot_len()
    }

    /// Number of slots in a ring of `page_count` pages: the largest power of
    /// two that fits after the control header.
    pub fn ring_slots(self, page_count: usize) -> u32 {
        let Some(bytes) = (page_count * PAGE_SIZE).checked_sub(RING_HEADER_LEN) else {
            return 0;
        };
        let slots = (bytes / self.slot_len()) as u32;
        if slots == 0 {
            0
        } else {
            1 << slots.ilog2()
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Native => f.write_str("native"),
            Protocol::X86_32 => f.write_str("x86_32"),
            Protocol::X86_64 => f.write_str("x86_64"),
        }
    }
}

/// Encodes and decodes ring slots for one protocol variant.
pub trait SlotCodec: Sync {
    /// Slot length in bytes.
    fn slot_len(&self) -> usize;

    /// Decode a request descriptor from a full slot.
    fn decode_request(&self, slot: &[u8]) -> Result<Descriptor>;

    /// Encode a request descriptor into a full slot (frontend side).
    fn encode_request(&self, desc: &Descriptor, slot: &mut [u8]) -> Result<()>;

    /// Encode a response into a full slot, zeroing the remainder.
    fn encode_response(&self, response: &Response, slot: &mut [u8]) -> Result<()>;

    /// Decode a response from a full slot (frontend side).
    fn decode_response(&self, slot: &[u8]) -> Result<Response>;
}

/// Byte offsets of the request fields within a slot. Responses use the same
/// offsets in every variant: id at 0, operation at 8, status at 10.
#[derive(Clone, Copy)]
struct RequestLayout {
    id: usize,
    sector: usize,
    segments: usize,
    slot_len: usize,
}

const NATIVE_LAYOUT: RequestLayout = RequestLayout {
    id: 8,
    sector: 16,
    segments: 24,
    slot_len: 112,
};

const X86_32_LAYOUT: RequestLayout = RequestLayout {
    id: 4,
    sector: 12,
    segments: 20,
    slot_len: 108,
};

const SEGMENT_STRIDE: usize = 8;

const RSP_ID_OFFSET: usize = 0;
const RSP_OPERATION_OFFSET: usize = 8;
const RSP_STATUS_OFFSET: usize = 10;

struct NativeCodec;
#[allow(non_camel_case_types)]
struct X86_32Codec;
#[allow(non_camel_case_types)]
struct X86_64Codec;

static NATIVE_CODEC: NativeCodec = NativeCodec;
static X86_32_CODEC: X86_32Codec = X86_32Codec;
static X86_64_CODEC: X86_64Codec = X86_64Codec;

macro_rules! impl_codec {
    ($codec:ty, $layout:expr) => {
        impl SlotCodec for $codec {
            fn slot_len(&self) -> usize {
                $layout.slot_len
            }

            fn decode_request(&self, slot: &[u8]) -> Result<Descriptor> {
                decode_request($layout, slot)
            }

            fn encode_request(&self, desc: &Descriptor, slot: &mut [u8]) -> Result<()> {
                encode_request($layout, desc, slot)
            }

            fn encode_response(&self, response: &Response, slot: &mut [u8]) -> Result<()> {
                encode_response($layout, response, slot)
            }

            fn decode_response(&self, slot: &[u8]) -> Result<Response> {
                decode_response($layout, slot)
            }
        }
    };
}

impl_codec!(NativeCodec, NATIVE_LAYOUT);
impl_codec!(X86_32Codec, X86_32_LAYOUT);
impl_codec!(X86_64Codec, NATIVE_LAYOUT);

fn check_len(layout: RequestLayout, actual: usize) -> Result<()> {
    if actual != layout.slot_len {
        return Err(ProtoError::InvalidLength {
            expected: layout.slot_len,
            actual,
        });
    }
    Ok(())
}

fn decode_request(layout: RequestLayout, slot: &[u8]) -> Result<Descriptor> {
    check_len(layout, slot.len())?;
    let mut desc = Descriptor {
        operation: slot[0],
        nr_segments: slot[1],
        handle: read_u16(slot, 2),
        id: read_u64(slot, layout.id),
        sector_number: read_u64(slot, layout.sector),
        segments: [SegmentDesc::default(); MAX_SEGMENTS_PER_REQUEST],
        nr_sectors: read_u64(slot, layout.segments),
    };
    for (i, segment) in desc.segments.iter_mut().enumerate() {
        let base = layout.segments + i * SEGMENT_STRIDE;
        segment.gref = read_u32(slot, base);
        segment.first_sect = slot[base + 4];
        segment.last_sect = slot[base + 5];
    }
    Ok(desc)
}

fn encode_request(layout: RequestLayout, desc: &Descriptor, slot: &mut [u8]) -> Result<()> {
    check_len(layout, slot.len())?;
    slot.fill(0);
    slot[0] = desc.operation;
    slot[1] = desc.nr_segments;
    write_u16(slot, 2, desc.handle);
    write_u64(slot, layout.id, desc.id);
    write_u64(slot, layout.sector, desc.sector_number);
    if desc.operation == OP_DISCARD {
        write_u64(slot, layout.segments, desc.nr_sectors);
    } else {
        for (i, segment) in desc.segments.iter().enumerate() {
            let base = layout.segments + i * SEGMENT_STRIDE;
            write_u32(slot, base, segment.gref);
            slot[base + 4] = segment.first_sect;
            slot[base + 5] = segment.last_sect;
        }
    }
    Ok(())
}

fn encode_response(layout: RequestLayout, response: &Response, slot: &mut [u8]) -> Result<()> {
    check_len(layout, slot.len())?;
    slot.fill(0);
    write_u64(slot, RSP_ID_OFFSET, response.id);
    slot[RSP_OPERATION_OFFSET] = response.operation;
    write_u16(slot, RSP_STATUS_OFFSET, response.status as u16);
    Ok(())
}

fn decode_response(layout: RequestLayout, slot: &[u8]) -> Result<Response> {
    check_len(layout, slot.len())?;
    Ok(Response {
        id: read_u64(slot, RSP_ID_OFFSET),
        operation: slot[RSP_OPERATION_OFFSET],
        status: read_u16(slot, RSP_STATUS_OFFSET) as i16,
    })
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
