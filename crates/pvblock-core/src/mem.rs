//! Guest-memory-by-reference collaborator.
//!
//! The engine never dereferences guest memory directly: ring pages are reached
//! through a [`RingMemory`] window produced by [`GrantTable::map`], and data
//! segments are moved with [`GrantTable::copy_to_guest`] /
//! [`GrantTable::copy_from_guest`]. A real deployment backs this with grant
//! tables or a shared-memory transport; [`HeapGrantTable`] backs it with
//! plain heap pages for tests and in-process embedders.

use crate::ring::RingMemory;
use pvblock_proto::PAGE_SIZE;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Describes the failure category for guest memory operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantErrorKind {
    /// A grant reference did not resolve to a page.
    BadRef,
    /// A segment reached outside its page or the supplied buffer.
    OutOfBounds,
    /// The underlying transport failed.
    Io,
}

/// Error surfaced by [`GrantTable`] implementations.
#[derive(Clone, Debug)]
pub struct GrantError {
    kind: GrantErrorKind,
    message: Option<String>,
}

impl GrantError {
    pub const fn new(kind: GrantErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: GrantErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> GrantErrorKind {
        self.kind
    }
}

impl fmt::Display for GrantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for GrantError {}

/// One copy step: a sub-range of a single granted page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopySegment {
    pub gref: u32,
    /// Byte offset within the page.
    pub offset: u32,
    /// Byte count; never crosses the page boundary.
    pub len: u32,
}

/// Maps and copies guest pages named by grant references.
pub trait GrantTable: Send + Sync {
    /// Map `refs` as one contiguous byte window, ring pages first.
    fn map(&self, refs: &[u32], writable: bool) -> Result<Box<dyn RingMemory>, GrantError>;

    /// Scatter `src` into the guest pages described by `segments`, in order.
    fn copy_to_guest(&self, segments: &[CopySegment], src: &[u8]) -> Result<(), GrantError>;

    /// Gather the guest pages described by `segments` into `dst`, in order.
    fn copy_from_guest(&self, segments: &[CopySegment], dst: &mut [u8]) -> Result<(), GrantError>;
}

type Page = Arc<Mutex<Box<[u8]>>>;

/// Heap-backed [`GrantTable`] for tests and in-process frontends.
///
/// Pages are plain 4 KiB heap allocations keyed by grant reference; mappings
/// hold `Arc` clones of the pages, so a window stays valid for as long as any
/// holder keeps it, independent of the table.
#[derive(Default)]
pub struct HeapGrantTable {
    pages: Mutex<HashMap<u32, Page>>,
}

impl HeapGrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` zeroed pages and return their grant references.
    pub fn add_pages(&self, count: usize) -> Vec<u32> {
        let mut pages = self.pages.lock().unwrap();
        let mut next = pages.keys().max().map_or(1, |gref| gref + 1);
        let mut refs = Vec::with_capacity(count);
        for _ in 0..count {
            pages.insert(
                next,
                Arc::new(Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
            );
            refs.push(next);
            next += 1;
        }
        refs
    }

    /// Read from a granted page, as the owning guest would.
    pub fn read_page(&self, gref: u32, offset: usize, out: &mut [u8]) -> Result<(), GrantError> {
        let page = self.page(gref)?;
        let page = page.lock().unwrap();
        bounds_check(offset, out.len())?;
        out.copy_from_slice(&page[offset..offset + out.len()]);
        Ok(())
    }

    /// Write into a granted page, as the owning guest would.
    pub fn write_page(&self, gref: u32, offset: usize, data: &[u8]) -> Result<(), GrantError> {
        let page = self.page(gref)?;
        let mut page = page.lock().unwrap();
        bounds_check(offset, data.len())?;
        page[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn page(&self, gref: u32) -> Result<Page, GrantError> {
        self.pages
            .lock()
            .unwrap()
            .get(&gref)
            .cloned()
            .ok_or_else(|| {
                GrantError::with_message(GrantErrorKind::BadRef, format!("grant ref {gref}"))
            })
    }
}

fn bounds_check(offset: usize, len: usize) -> Result<(), GrantError> {
    if offset + len > PAGE_SIZE {
        return Err(GrantError::new(GrantErrorKind::OutOfBounds));
    }
    Ok(())
}

impl GrantTable for HeapGrantTable {
    fn map(&self, refs: &[u32], _writable: bool) -> Result<Box<dyn RingMemory>, GrantError> {
        let mut pages = Vec::with_capacity(refs.len());
        for gref in refs {
            pages.push(self.page(*gref)?);
        }
        Ok(Box::new(HeapMapping { pages }))
    }

    fn copy_to_guest(&self, segments: &[CopySegment], src: &[u8]) -> Result<(), GrantError> {
        let mut cursor = 0usize;
        for segment in segments {
            let len = segment.len as usize;
            if cursor + len > src.len() {
                return Err(GrantError::new(GrantErrorKind::OutOfBounds));
            }
            self.write_page(
                segment.gref,
                segment.offset as usize,
                &src[cursor..cursor + len],
            )?;
            cursor += len;
        }
        Ok(())
    }

    fn copy_from_guest(&self, segments: &[CopySegment], dst: &mut [u8]) -> Result<(), GrantError> {
        let mut cursor = 0usize;
        for segment in segments {
            let len = segment.len as usize;
            if cursor + len > dst.len() {
                return Err(GrantError::new(GrantErrorKind::OutOfBounds));
            }
            self.read_page(
                segment.gref,
                segment.offset as usize,
                &mut dst[cursor..cursor + len],
            )?;
            cursor += len;
        }
        Ok(())
    }
}

/// Contiguous window over a sequence of heap pages.
struct HeapMapping {
    pages: Vec<Page>,
}

impl RingMemory for HeapMapping {
    fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len(), "read past end of mapping");
        let mut page_idx = offset / PAGE_SIZE;
        let mut page_off = offset % PAGE_SIZE;
        let mut cursor = 0usize;
        while cursor < out.len() {
            let chunk = (out.len() - cursor).min(PAGE_SIZE - page_off);
            let page = self.pages[page_idx].lock().unwrap();
            out[cursor..cursor + chunk].copy_from_slice(&page[page_off..page_off + chunk]);
            cursor += chunk;
            page_idx += 1;
            page_off = 0;
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.len(),
            "write past end of mapping"
        );
        let mut page_idx = offset / PAGE_SIZE;
        let mut page_off = offset % PAGE_SIZE;
        let mut cursor = 0usize;
        while cursor < data.len() {
            let chunk = (data.len() - cursor).min(PAGE_SIZE - page_off);
            let mut page = self.pages[page_idx].lock().unwrap();
            page[page_off..page_off + chunk].copy_from_slice(&data[cursor..cursor + chunk]);
            cursor += chunk;
            page_idx += 1;
            page_off = 0;
        }
    }

    fn load_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn store_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }
}
