//! Backend dataplane for a paravirtual block device.
//!
//! A guest publishes request descriptors onto a shared-memory ring; this
//! crate drains that ring, validates each descriptor, runs the resulting
//! reads, writes, flushes, and discards against a [`BlockBackend`], and
//! pushes responses back through the same slots with event-index
//! notification suppression.
//!
//! The external world is reached through four narrow seams: [`GrantTable`]
//! for guest memory, [`EventChannel`] for the doorbell to the frontend,
//! [`BlockBackend`] for storage, and [`RingMemory`] for the mapped ring
//! pages. Heap-backed implementations of the first and last ship here for
//! tests and in-process frontends.

pub mod backend;
pub mod chan;
pub mod dispatch;
pub mod engine;
pub mod mem;
pub mod metrics;
pub mod pool;
pub mod ring;
pub mod validate;

pub use backend::{BackendError, BackendErrorKind, BackendResult, BlockBackend};
pub use chan::{CountingChannel, EventChannel};
pub use engine::{Engine, EngineHandle};
pub use mem::{CopySegment, GrantError, GrantErrorKind, GrantTable, HeapGrantTable};
pub use ring::{HeapRing, RingMemory, RingTransport};
pub use validate::{DeviceLimits, Operation, ValidationError};

pub use pvblock_proto as proto;
